//! Learned remediation history.
//!
//! Records which fix actions have worked for a failure signature and hands
//! them back once they have proven themselves often enough. A signature
//! identifies the pattern (name, regex source, category), never the exact
//! log line, so one success generalizes across every line the pattern
//! matches.
//!
//! Every mutation is written through to `wisdom.json` immediately.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WisdomConfig;
use crate::persist::{load_json_or_default, save_json_atomic};

/// Current on-disk format version.
const WISDOM_VERSION: &str = "1.0";

/// Stable signature for a pattern: md5 over name, regex source and category.
pub fn pattern_signature(name: &str, regex_source: &str, category: &str) -> String {
    let mut input = String::with_capacity(name.len() + regex_source.len() + category.len() + 2);
    input.push_str(name);
    input.push('\u{1f}');
    input.push_str(regex_source);
    input.push('\u{1f}');
    input.push_str(category);
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// A learned (signature, fix) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WisdomPattern {
    pub id: String,
    pub error_signature: String,
    pub fix_action: String,
    pub success_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WisdomFile {
    last_updated: DateTime<Utc>,
    version: String,
    #[serde(default)]
    patterns: Vec<WisdomPattern>,
    #[serde(default)]
    session_count: u64,
    #[serde(default)]
    total_heals: u64,
    #[serde(default)]
    total_failures: u64,
}

impl Default for WisdomFile {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            version: WISDOM_VERSION.to_string(),
            patterns: Vec::new(),
            session_count: 0,
            total_heals: 0,
            total_failures: 0,
        }
    }
}

/// Aggregate counters for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WisdomStats {
    pub patterns: usize,
    pub trusted: usize,
    pub session_count: u64,
    pub total_heals: u64,
    pub total_failures: u64,
}

/// Persistent store of learned fixes.
#[derive(Debug)]
pub struct WisdomStore {
    path: Option<PathBuf>,
    config: WisdomConfig,
    data: WisdomFile,
}

impl WisdomStore {
    /// Load the store from `path`, dropping expired patterns.
    pub fn load(path: impl Into<PathBuf>, config: WisdomConfig) -> Self {
        let path = path.into();
        let data: WisdomFile = load_json_or_default(&path);
        let mut store = Self {
            path: Some(path),
            config,
            data,
        };
        let purged = store.purge_expired();
        debug!(
            "[healer] Wisdom loaded: {} patterns ({} expired removed)",
            store.data.patterns.len(),
            purged
        );
        store
    }

    /// Store that never touches disk.
    pub fn in_memory(config: WisdomConfig) -> Self {
        Self {
            path: None,
            config,
            data: WisdomFile::default(),
        }
    }

    fn expiry(&self) -> Duration {
        Duration::days(i64::from(self.config.pattern_expiry_days))
    }

    pub fn patterns(&self) -> &[WisdomPattern] {
        &self.data.patterns
    }

    /// Count a new monitor session.
    pub fn start_session(&mut self) {
        self.data.session_count += 1;
        self.persist();
    }

    pub fn record_success(&mut self, signature: &str, action: &str, context: &[String]) {
        self.record_success_at(signature, action, context, Utc::now());
    }

    /// Find-or-create the pair, bump its count and merge context tags.
    pub fn record_success_at(
        &mut self,
        signature: &str,
        action: &str,
        context: &[String],
        now: DateTime<Utc>,
    ) {
        self.data.total_heals += 1;

        match self
            .data
            .patterns
            .iter_mut()
            .find(|p| p.error_signature == signature && p.fix_action == action)
        {
            Some(pattern) => {
                pattern.success_count += 1;
                pattern.last_seen = now;
                for tag in context {
                    if !pattern.context.contains(tag) {
                        pattern.context.push(tag.clone());
                    }
                }
                if pattern.success_count == self.config.min_success_for_trust {
                    info!(
                        "[healer] Fix '{}' is now trusted for signature {}",
                        action, signature
                    );
                }
            }
            None => {
                let mut tags: Vec<String> = Vec::new();
                for tag in context {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
                self.data.patterns.push(WisdomPattern {
                    id: Uuid::new_v4().to_string(),
                    error_signature: signature.to_string(),
                    fix_action: action.to_string(),
                    success_count: 1,
                    first_seen: now,
                    last_seen: now,
                    context: tags,
                });
            }
        }

        self.data.last_updated = now;
        self.persist();
    }

    /// Count a failed fix. Existing success history is kept.
    pub fn record_failure(&mut self, signature: &str, action: &str) {
        debug!(
            "[healer] Fix '{}' failed for signature {}",
            action, signature
        );
        self.data.total_failures += 1;
        self.data.last_updated = Utc::now();
        self.persist();
    }

    pub fn find_trusted(&self, signature: &str) -> Option<WisdomPattern> {
        self.find_trusted_at(signature, Utc::now())
    }

    /// Highest-count fix for `signature` that meets the trust threshold and
    /// was seen within the expiry window.
    pub fn find_trusted_at(&self, signature: &str, now: DateTime<Utc>) -> Option<WisdomPattern> {
        let expiry = self.expiry();
        self.data
            .patterns
            .iter()
            .filter(|p| p.error_signature == signature)
            .filter(|p| p.success_count >= self.config.min_success_for_trust)
            .filter(|p| now - p.last_seen < expiry)
            .max_by_key(|p| p.success_count)
            .cloned()
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Drop patterns not seen within the expiry window.
    pub fn purge_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let expiry = self.expiry();
        let before = self.data.patterns.len();
        self.data.patterns.retain(|p| now - p.last_seen < expiry);
        let removed = before - self.data.patterns.len();
        if removed > 0 {
            info!("[healer] Purged {} expired wisdom patterns", removed);
            self.data.last_updated = now;
            self.persist();
        }
        removed
    }

    pub fn stats(&self) -> WisdomStats {
        let now = Utc::now();
        let expiry = self.expiry();
        WisdomStats {
            patterns: self.data.patterns.len(),
            trusted: self
                .data
                .patterns
                .iter()
                .filter(|p| {
                    p.success_count >= self.config.min_success_for_trust
                        && now - p.last_seen < expiry
                })
                .count(),
            session_count: self.data.session_count,
            total_heals: self.data.total_heals,
            total_failures: self.data.total_failures,
        }
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = save_json_atomic(path, &self.data) {
                warn!("[healer] Failed to save wisdom: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(threshold: u32) -> WisdomConfig {
        WisdomConfig {
            pattern_expiry_days: 30,
            min_success_for_trust: threshold,
        }
    }

    #[test]
    fn test_signature_is_stable_and_distinct() {
        let a = pattern_signature("rate-limit", "429", "HIGH");
        assert_eq!(a, pattern_signature("rate-limit", "429", "HIGH"));
        assert_ne!(a, pattern_signature("rate-limit", "429", "WARN"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_trust_threshold_boundary() {
        let mut store = WisdomStore::in_memory(config(3));
        store.record_success("sig", "restart", &[]);
        store.record_success("sig", "restart", &[]);
        assert!(store.find_trusted("sig").is_none());

        store.record_success("sig", "restart", &[]);
        let trusted = store.find_trusted("sig").unwrap();
        assert_eq!(trusted.fix_action, "restart");
        assert_eq!(trusted.success_count, 3);
    }

    #[test]
    fn test_highest_count_wins() {
        let mut store = WisdomStore::in_memory(config(1));
        store.record_success("sig", "a", &[]);
        store.record_success("sig", "b", &[]);
        store.record_success("sig", "b", &[]);
        assert_eq!(store.find_trusted("sig").unwrap().fix_action, "b");
        assert!(store.find_trusted("other").is_none());
    }

    #[test]
    fn test_expired_pattern_not_trusted_and_purged() {
        let now = Utc::now();
        let mut store = WisdomStore::in_memory(config(1));
        store.record_success_at("sig", "fix", &[], now - Duration::days(31));

        assert!(store.find_trusted_at("sig", now).is_none());
        assert!(store.find_trusted_at("sig", now - Duration::days(30)).is_some());
        assert_eq!(store.purge_expired_at(now), 1);
        assert!(store.patterns().is_empty());
    }

    #[test]
    fn test_context_tags_are_unioned() {
        let mut store = WisdomStore::in_memory(config(1));
        store.record_success("sig", "fix", &["a".into(), "b".into()]);
        store.record_success("sig", "fix", &["b".into(), "c".into()]);
        assert_eq!(store.patterns()[0].context, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failure_keeps_history() {
        let mut store = WisdomStore::in_memory(config(1));
        store.record_success("sig", "fix", &[]);
        store.record_failure("sig", "fix");
        assert!(store.find_trusted("sig").is_some());
        let stats = store.stats();
        assert_eq!(stats.total_heals, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.trusted, 1);
    }

    #[test]
    fn test_write_through_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wisdom.json");

        let mut store = WisdomStore::load(&path, config(2));
        store.start_session();
        store.record_success("sig", "fix", &["prd".into()]);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"errorSignature\": \"sig\""));
        assert!(raw.contains("\"sessionCount\": 1"));

        let reloaded = WisdomStore::load(&path, config(2));
        assert_eq!(reloaded.patterns().len(), 1);
        assert_eq!(reloaded.stats().session_count, 1);
    }

    #[test]
    fn test_load_purges_expired() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wisdom.json");

        let mut store = WisdomStore::load(&path, config(1));
        store.record_success_at("old", "fix", &[], Utc::now() - Duration::days(45));
        store.record_success("new", "fix", &[]);

        let reloaded = WisdomStore::load(&path, config(1));
        assert_eq!(reloaded.patterns().len(), 1);
        assert_eq!(reloaded.patterns()[0].error_signature, "new");
    }
}
