//! Persisted per-session monitor state (`monitor-state.json`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analyzer::ThrottleState;
use crate::circuit::CircuitBreaker;
use crate::config::HealerConfig;
use crate::error::Result;
use crate::persist::{load_json_or_default, save_json_atomic};

/// Outcome of one recovery attempt. `success` stays `None` until the task
/// completes or fails again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub success: Option<bool>,
}

/// Everything the monitor keeps across restarts within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub llm_calls_count: u32,
    #[serde(default, rename = "lastLLMCall")]
    pub last_llm_call: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detected_patterns: BTreeMap<String, u32>,
    /// Normalized unknown-error lines already sent for analysis.
    #[serde(default)]
    pub unknown_error_cache: BTreeSet<String>,
    /// Keyed by `taskId:exitReason`.
    #[serde(default)]
    pub recovery_history: BTreeMap<String, RecoveryRecord>,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub recovery_successes: u32,
    #[serde(default)]
    pub recovery_failures: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new_session(CircuitBreaker::default(), Utc::now())
    }
}

impl MonitorState {
    /// Fresh session carrying `breaker`.
    pub fn new_session(breaker: CircuitBreaker, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_activity: now,
            llm_calls_count: 0,
            last_llm_call: None,
            detected_patterns: BTreeMap::new(),
            unknown_error_cache: BTreeSet::new(),
            recovery_history: BTreeMap::new(),
            recovery_attempts: 0,
            recovery_successes: 0,
            recovery_failures: 0,
            circuit_breaker: breaker,
        }
    }

    /// Read the state file without deciding anything about the session.
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let state: Option<Self> = load_json_or_default(path);
        state
    }

    /// Resume the persisted session if it saw activity within the stale
    /// window, otherwise start a new one. The circuit breaker survives
    /// across sessions.
    pub fn resume_or_start(path: &Path, config: &HealerConfig, now: DateTime<Utc>) -> Self {
        let Some(previous) = Self::load(path) else {
            return Self::new_session(CircuitBreaker::new(&config.circuit_breaker), now);
        };

        let idle = now - previous.last_activity;
        if idle < Duration::milliseconds(config.health.stale_detection_ms as i64) {
            info!("[healer] Resuming session {}", previous.session_id);
            return previous;
        }

        debug!(
            "[healer] Previous session {} idle for {}s, starting fresh",
            previous.session_id,
            idle.num_seconds()
        );
        Self::new_session(previous.circuit_breaker, now)
    }

    /// Write the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the atomic write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json_atomic(path, self)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn idle_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity
    }

    pub fn record_pattern(&mut self, pattern: &str) -> u32 {
        let count = self.detected_patterns.entry(pattern.to_string()).or_default();
        *count += 1;
        *count
    }

    /// Remember an unknown error. Returns `false` if it was already seen.
    pub fn is_unknown_seen(&self, normalized: &str) -> bool {
        self.unknown_error_cache.contains(normalized)
    }

    pub fn mark_unknown_seen(&mut self, normalized: &str) -> bool {
        self.unknown_error_cache.insert(normalized.to_string())
    }

    pub fn throttle(&self) -> ThrottleState {
        ThrottleState {
            call_count: self.llm_calls_count,
            last_call: self.last_llm_call,
        }
    }

    pub fn set_throttle(&mut self, throttle: ThrottleState) {
        self.llm_calls_count = throttle.call_count;
        self.last_llm_call = throttle.last_call;
    }

    pub fn has_recovery(&self, key: &str) -> bool {
        self.recovery_history.contains_key(key)
    }

    /// Record a new recovery attempt under `key`.
    pub fn start_recovery(&mut self, key: &str, now: DateTime<Utc>) {
        self.recovery_history.insert(
            key.to_string(),
            RecoveryRecord {
                timestamp: now,
                success: None,
            },
        );
        self.recovery_attempts += 1;
    }

    /// Settle every open recovery for `task_id`. Returns how many were
    /// settled.
    pub fn resolve_recoveries(&mut self, task_id: &str, success: bool) -> u32 {
        let prefix = format!("{task_id}:");
        let mut settled = 0;
        for (_, record) in self
            .recovery_history
            .iter_mut()
            .filter(|(k, r)| k.starts_with(&prefix) && r.success.is_none())
        {
            record.success = Some(success);
            settled += 1;
        }
        if success {
            self.recovery_successes += settled;
        } else {
            self.recovery_failures += settled;
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_serializes_documented_keys() {
        let mut state = MonitorState::default();
        state.last_llm_call = Some(Utc::now());
        state.record_pattern("rate-limit");
        let json = serde_json::to_value(&state).unwrap();

        for key in [
            "sessionId",
            "startTime",
            "lastActivity",
            "llmCallsCount",
            "lastLLMCall",
            "detectedPatterns",
            "unknownErrorCache",
            "recoveryHistory",
            "recoveryAttempts",
            "recoverySuccesses",
            "recoveryFailures",
            "circuitBreaker",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["detectedPatterns"]["rate-limit"], 1);
    }

    #[test]
    fn test_unknown_seen_set() {
        let mut state = MonitorState::default();
        assert!(!state.is_unknown_seen("boom"));
        assert!(state.mark_unknown_seen("boom"));
        assert!(state.is_unknown_seen("boom"));
        assert!(!state.mark_unknown_seen("boom"));
    }

    #[test]
    fn test_recovery_bookkeeping() {
        let mut state = MonitorState::default();
        let now = Utc::now();
        state.start_recovery("T-1:vague_prd", now);
        state.start_recovery("T-2:scope_large", now);
        assert!(state.has_recovery("T-1:vague_prd"));
        assert_eq!(state.recovery_attempts, 2);

        assert_eq!(state.resolve_recoveries("T-1", true), 1);
        assert_eq!(state.resolve_recoveries("T-1", false), 0);
        assert_eq!(state.resolve_recoveries("T-2", false), 1);
        assert_eq!(state.recovery_successes, 1);
        assert_eq!(state.recovery_failures, 1);
        assert_eq!(state.recovery_history["T-1:vague_prd"].success, Some(true));
    }

    #[test]
    fn test_resume_recent_session() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("monitor-state.json");
        let config = HealerConfig::default();
        let now = Utc::now();

        let first = MonitorState::resume_or_start(&path, &config, now);
        first.save(&path).unwrap();

        let resumed = MonitorState::resume_or_start(&path, &config, now + Duration::seconds(10));
        assert_eq!(resumed.session_id, first.session_id);
    }

    #[test]
    fn test_stale_session_starts_fresh_but_keeps_breaker() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("monitor-state.json");
        let config = HealerConfig::default();
        let now = Utc::now();

        let mut first = MonitorState::resume_or_start(&path, &config, now);
        first.circuit_breaker.record_failure_at(now);
        first.llm_calls_count = 4;
        first.save(&path).unwrap();

        let later = now + Duration::hours(2);
        let next = MonitorState::resume_or_start(&path, &config, later);
        assert_ne!(next.session_id, first.session_id);
        assert_eq!(next.llm_calls_count, 0);
        assert_eq!(next.circuit_breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("monitor-state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let state = MonitorState::resume_or_start(&path, &HealerConfig::default(), Utc::now());
        assert_eq!(state.recovery_attempts, 0);
        assert!(temp.path().join("monitor-state.json.corrupt").exists());
    }
}
