//! Per-key concurrency admission control for external calls.
//!
//! Each key (normally a model id such as `claude-sonnet-4`) gets its own
//! semaphore, created lazily with the most specific configured limit:
//! an exact model override, then the provider override, then the default.
//! Acquiring blocks for at most the caller's timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::ConcurrencyConfig;
use crate::error::{HealerError, Result};

/// A granted slot for one key. The slot is returned when the lease drops.
#[derive(Debug)]
pub struct Lease {
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Key this lease was granted for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Bounds concurrent holders per key.
#[derive(Debug)]
pub struct AdmissionController {
    config: ConcurrencyConfig,
    semaphores: Mutex<HashMap<String, (usize, Arc<Semaphore>)>>,
}

impl AdmissionController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Provider part of a key: the text before the first `/` or `-`.
    fn provider_of(key: &str) -> &str {
        key.split(['/', '-']).next().unwrap_or(key)
    }

    /// Effective limit for `key`; the most specific override wins.
    pub fn limit_for(&self, key: &str) -> usize {
        if let Some(limit) = self.config.model_limits.get(key) {
            return (*limit).max(1);
        }
        if let Some(limit) = self.config.provider_limits.get(Self::provider_of(key)) {
            return (*limit).max(1);
        }
        self.config.default_limit.max(1)
    }

    fn semaphore_for(&self, key: &str) -> Result<(usize, Arc<Semaphore>)> {
        let mut map = self.semaphores.lock().map_err(|e| HealerError::Lock {
            message: format!("admission map poisoned: {e}"),
        })?;
        let entry = map.entry(key.to_string()).or_insert_with(|| {
            let limit = self.limit_for(key);
            debug!("[healer] Admission key '{}' limited to {}", key, limit);
            (limit, Arc::new(Semaphore::new(limit)))
        });
        Ok((entry.0, Arc::clone(&entry.1)))
    }

    /// Acquire a lease for `key`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::AdmissionTimeout`] if no slot frees up in time.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<Lease> {
        let (_, semaphore) = self.semaphore_for(key)?;
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Lease {
                key: key.to_string(),
                _permit: permit,
            }),
            Ok(Err(_closed)) => Err(HealerError::Lock {
                message: format!("admission semaphore for '{key}' closed"),
            }),
            Err(_) => {
                warn!(
                    "[healer] Admission for '{}' timed out after {}ms",
                    key,
                    timeout.as_millis()
                );
                Err(HealerError::AdmissionTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Acquire using the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_default(&self, key: &str) -> Result<Lease> {
        self.acquire(key, Duration::from_millis(self.config.acquire_timeout_ms))
            .await
    }

    /// Return a lease explicitly.
    pub fn release(&self, lease: Lease) {
        debug!("[healer] Released admission lease for '{}'", lease.key);
        drop(lease);
    }

    /// Number of leases currently held for `key`.
    pub fn in_flight(&self, key: &str) -> usize {
        let Ok(map) = self.semaphores.lock() else {
            return 0;
        };
        map.get(key)
            .map(|(limit, sem)| limit.saturating_sub(sem.available_permits()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(default_limit: usize) -> AdmissionController {
        let mut config = ConcurrencyConfig {
            default_limit,
            ..ConcurrencyConfig::default()
        };
        config.provider_limits.insert("claude".into(), 2);
        config.model_limits.insert("claude-opus-4".into(), 1);
        AdmissionController::new(config)
    }

    #[test]
    fn test_limit_resolution_most_specific_wins() {
        let ac = controller(3);
        assert_eq!(ac.limit_for("claude-opus-4"), 1);
        assert_eq!(ac.limit_for("claude-sonnet-4"), 2);
        assert_eq!(ac.limit_for("gpt-4o"), 3);
        assert_eq!(ac.limit_for("claude/anything"), 2);
    }

    #[tokio::test]
    async fn test_acquire_within_limit() {
        let ac = controller(1);
        let a = ac.acquire("claude-sonnet-4", Duration::from_millis(50)).await.unwrap();
        let b = ac.acquire("claude-sonnet-4", Duration::from_millis(50)).await.unwrap();
        assert_eq!(ac.in_flight("claude-sonnet-4"), 2);
        assert_eq!(a.key(), "claude-sonnet-4");
        ac.release(a);
        drop(b);
        assert_eq!(ac.in_flight("claude-sonnet-4"), 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let ac = controller(1);
        let _held = ac.acquire("claude-opus-4", Duration::from_millis(50)).await.unwrap();

        let err = ac
            .acquire("claude-opus-4", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, HealerError::AdmissionTimeout { ref key, timeout_ms: 30 } if key == "claude-opus-4"));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let ac = Arc::new(controller(1));
        let held = ac.acquire("local", Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let ac = Arc::clone(&ac);
            tokio::spawn(async move { ac.acquire("local", Duration::from_secs(2)).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ac.release(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let ac = controller(1);
        let _a = ac.acquire("model-a", Duration::from_millis(20)).await.unwrap();
        assert!(ac.acquire("model-b", Duration::from_millis(20)).await.is_ok());
        assert_eq!(ac.in_flight("unknown"), 0);
    }
}
