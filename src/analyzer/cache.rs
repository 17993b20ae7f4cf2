//! Expiring cache of analyses keyed by normalized error hash.
//!
//! Persisted as `llm-cache.json`: a map of `errorHash` to
//! `{errorHash, analysis, cachedAt, expiresAt}`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Analysis, AnalysisSource};
use crate::persist::{load_json_or_default, save_json_atomic};

/// One cached analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub error_hash: String,
    pub analysis: Analysis,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Analysis cache with write-through persistence.
#[derive(Debug)]
pub struct AnalysisCache {
    path: Option<PathBuf>,
    ttl: Duration,
    entries: BTreeMap<String, CacheEntry>,
}

impl AnalysisCache {
    /// Load from `path`. Missing or corrupt files start empty.
    pub fn load(path: impl Into<PathBuf>, ttl_ms: u64) -> Self {
        let path = path.into();
        let entries: BTreeMap<String, CacheEntry> = load_json_or_default(&path);
        debug!("[healer] Loaded {} cached analyses", entries.len());
        Self {
            path: Some(path),
            ttl: Duration::milliseconds(ttl_ms as i64),
            entries,
        }
    }

    /// Cache that never touches disk.
    pub fn in_memory(ttl_ms: u64) -> Self {
        Self {
            path: None,
            ttl: Duration::milliseconds(ttl_ms as i64),
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, hash: &str) -> Option<Analysis> {
        self.get_at(hash, Utc::now())
    }

    /// Look up `hash`; an expired entry is dropped and treated as a miss.
    pub fn get_at(&mut self, hash: &str, now: DateTime<Utc>) -> Option<Analysis> {
        let entry = self.entries.get(hash)?;
        if entry.is_expired_at(now) {
            self.entries.remove(hash);
            self.persist();
            return None;
        }
        let mut analysis = entry.analysis.clone();
        analysis.cached = true;
        analysis.source = AnalysisSource::Cache;
        Some(analysis)
    }

    pub fn put(&mut self, hash: &str, analysis: &Analysis) {
        self.put_at(hash, analysis, Utc::now());
    }

    pub fn put_at(&mut self, hash: &str, analysis: &Analysis, now: DateTime<Utc>) {
        let mut stored = analysis.clone();
        stored.cached = false;
        self.entries.insert(
            hash.to_string(),
            CacheEntry {
                error_hash: hash.to_string(),
                analysis: stored,
                cached_at: now,
                expires_at: now + self.ttl,
            },
        );
        self.persist();
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("[healer] Pruned {} expired cache entries", removed);
            self.persist();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = save_json_atomic(path, &self.entries) {
                warn!("[healer] Failed to save analysis cache: {}", e);
            }
        }
    }
}
