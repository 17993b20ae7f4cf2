//! Fallback analysis for errors no classifier rule recognizes.
//!
//! Pipeline for [`LlmAnalyzer::analyze`], first hit wins:
//!
//! 1. cache lookup by [`hash_error`]
//! 2. deterministic keyword rules (cached on match)
//! 3. throttle check: session quota and cooldown
//! 4. admission lease for the model, then one paid call
//!
//! Every path returns a well-formed [`Analysis`]; failures of the paid call
//! degrade to a low-confidence generic result.

pub mod cache;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::{CacheConfig, LlmConfig};
use crate::llm::LlmClient;

pub use cache::{AnalysisCache, CacheEntry};

/// Maximum normalized length fed into the hash.
const MAX_NORMALIZED_LEN: usize = 500;

// ============================================================================
// Analysis
// ============================================================================

/// Where an [`Analysis`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Cache,
    Rules,
    Llm,
    Throttled,
    #[default]
    Fallback,
}

impl std::fmt::Display for AnalysisSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cache => "cache",
            Self::Rules => "rules",
            Self::Llm => "llm",
            Self::Throttled => "throttled",
            Self::Fallback => "fallback",
        };
        write!(f, "{s}")
    }
}

/// Root cause and suggested fixes for one error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub root_cause: String,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(skip)]
    pub cached: bool,
    #[serde(skip)]
    pub source: AnalysisSource,
}

impl Analysis {
    fn new(root_cause: &str, fixes: &[&str], confidence: f64, source: AnalysisSource) -> Self {
        Self {
            root_cause: root_cause.to_string(),
            suggested_fixes: fixes.iter().map(|s| s.to_string()).collect(),
            confidence,
            cached: false,
            source,
        }
    }

    /// Low-confidence placeholder returned when a paid call is not allowed.
    pub fn throttled(reason: &str) -> Self {
        Self {
            root_cause: format!("Analysis throttled: {reason}"),
            suggested_fixes: vec!["Review the error manually".to_string()],
            confidence: 0.1,
            cached: false,
            source: AnalysisSource::Throttled,
        }
    }

    /// Generic result when every other step produced nothing usable.
    pub fn fallback() -> Self {
        Self::new(
            "Unknown error - manual investigation required",
            &[
                "Inspect the surrounding log output",
                "Re-run the failing step with verbose logging",
            ],
            0.3,
            AnalysisSource::Fallback,
        )
    }

    pub fn is_throttled(&self) -> bool {
        self.source == AnalysisSource::Throttled
    }
}

// ============================================================================
// Normalization and hashing
// ============================================================================

struct Normalizer {
    date: Option<Regex>,
    time: Option<Regex>,
    path: Option<Regex>,
    space: Option<Regex>,
}

impl Normalizer {
    fn new() -> Self {
        Self {
            date: Regex::new(r"\d{4}-\d{2}-\d{2}").ok(),
            time: Regex::new(r"\d{1,2}:\d{2}:\d{2}(?:[.,]\d+)?").ok(),
            path: Regex::new(r#"(?:[a-z]:\\|/)[^\s:'"()\[\],]+"#).ok(),
            space: Regex::new(r"\s+").ok(),
        }
    }

    fn apply(&self, message: &str) -> String {
        let mut text = message.to_lowercase();
        for (re, token) in [(&self.date, "DATE"), (&self.time, "TIME"), (&self.path, "PATH")] {
            if let Some(re) = re {
                text = re.replace_all(&text, token).into_owned();
            }
        }
        if let Some(re) = &self.space {
            text = re.replace_all(&text, " ").into_owned();
        }
        text.trim().chars().take(MAX_NORMALIZED_LEN).collect()
    }
}

/// Normalize an error message so that messages differing only in embedded
/// dates, times or absolute paths compare equal.
pub fn normalize_error(message: &str) -> String {
    thread_local! {
        static NORMALIZER: Normalizer = Normalizer::new();
    }
    NORMALIZER.with(|n| n.apply(message))
}

/// SHA-256 hex digest of [`normalize_error`].
pub fn hash_error(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_error(message).as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Deterministic rules
// ============================================================================

/// Keyword rules tried before any paid call.
pub fn rule_based_analysis(message: &str) -> Option<Analysis> {
    let lower = message.to_lowercase();

    if message.contains("ENOENT") {
        return Some(Analysis::new(
            "File or resource not found",
            &["Verify the path exists", "Check the working directory", "Create the missing file or directory"],
            0.9,
            AnalysisSource::Rules,
        ));
    }
    if lower.contains("not found") || lower.contains("no such file") {
        return Some(Analysis::new(
            "File or resource not found",
            &["Verify the path exists", "Check the working directory"],
            0.8,
            AnalysisSource::Rules,
        ));
    }
    if message.contains("EACCES") || lower.contains("permission denied") {
        return Some(Analysis::new(
            "Permission denied",
            &["Check file ownership and mode", "Run with the required privileges"],
            0.9,
            AnalysisSource::Rules,
        ));
    }
    if message.contains("ETIMEDOUT") {
        return Some(Analysis::new(
            "Operation timed out",
            &["Check network connectivity", "Retry with a longer timeout"],
            0.9,
            AnalysisSource::Rules,
        ));
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Some(Analysis::new(
            "Operation timed out",
            &["Retry with a longer timeout", "Check whether the remote side is overloaded"],
            0.7,
            AnalysisSource::Rules,
        ));
    }
    if message.contains("429") || lower.contains("rate limit") {
        return Some(Analysis::new(
            "Rate limit exceeded",
            &["Wait before retrying", "Reduce request frequency"],
            0.9,
            AnalysisSource::Rules,
        ));
    }
    None
}

// ============================================================================
// Throttle
// ============================================================================

/// Paid-call accounting for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleState {
    pub call_count: u32,
    pub last_call: Option<DateTime<Utc>>,
}

/// Outcome of [`should_throttle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    SessionCap { used: u32, max: u32 },
    Cooldown { remaining: Duration },
}

impl ThrottleDecision {
    pub fn is_throttled(&self) -> bool {
        !matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Allowed => None,
            Self::SessionCap { used, max } => Some(format!(
                "session limit reached ({used}/{max} LLM calls)"
            )),
            Self::Cooldown { remaining } => Some(format!(
                "cooldown active ({}s remaining)",
                remaining.as_secs().max(1)
            )),
        }
    }
}

/// Decide whether a paid call may happen at `now`.
pub fn should_throttle(state: &ThrottleState, config: &LlmConfig, now: DateTime<Utc>) -> ThrottleDecision {
    if state.call_count >= config.max_per_session {
        return ThrottleDecision::SessionCap {
            used: state.call_count,
            max: config.max_per_session,
        };
    }
    if let Some(last) = state.last_call {
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        let cooldown = Duration::from_millis(config.cooldown_ms);
        if elapsed < cooldown {
            return ThrottleDecision::Cooldown {
                remaining: cooldown - elapsed,
            };
        }
    }
    ThrottleDecision::Allowed
}

// ============================================================================
// Prompt and response
// ============================================================================

fn build_prompt(message: &str) -> String {
    format!(
        "You are diagnosing a failure in an automated coding loop.\n\
         Error output:\n```\n{message}\n```\n\n\
         Respond with JSON only, in exactly this shape:\n\
         {{\"rootCause\": \"<one sentence>\", \"suggestedFixes\": [\"<fix>\", ...], \"confidence\": <0.0-1.0>}}"
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmReply {
    root_cause: String,
    #[serde(default)]
    suggested_fixes: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

/// Extract the JSON object from a model reply. `None` if absent or invalid.
pub fn parse_llm_response(text: &str) -> Option<Analysis> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let reply: LlmReply = serde_json::from_str(&text[start..=end]).ok()?;
    if reply.root_cause.trim().is_empty() {
        return None;
    }
    let confidence = if reply.confidence.is_finite() {
        reply.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Some(Analysis {
        root_cause: reply.root_cause,
        suggested_fixes: reply.suggested_fixes,
        confidence,
        cached: false,
        source: AnalysisSource::Llm,
    })
}

// ============================================================================
// Analyzer
// ============================================================================

/// Cache, rules, throttle and paid call in one pipeline.
pub struct LlmAnalyzer {
    client: Arc<dyn LlmClient>,
    admission: Arc<AdmissionController>,
    acquire_timeout: Duration,
    config: LlmConfig,
    cache_enabled: bool,
    cache: Mutex<AnalysisCache>,
    throttle: Mutex<ThrottleState>,
}

impl std::fmt::Debug for LlmAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAnalyzer")
            .field("model", &self.client.model_name())
            .field("config", &self.config)
            .field("cache_enabled", &self.cache_enabled)
            .finish()
    }
}

impl LlmAnalyzer {
    pub fn new(
        client: Arc<dyn LlmClient>,
        admission: Arc<AdmissionController>,
        acquire_timeout: Duration,
        config: LlmConfig,
        cache_config: &CacheConfig,
        cache: AnalysisCache,
    ) -> Self {
        Self {
            client,
            admission,
            acquire_timeout,
            config,
            cache_enabled: cache_config.enabled,
            cache: Mutex::new(cache),
            throttle: Mutex::new(ThrottleState::default()),
        }
    }

    /// Admission key for paid calls.
    pub fn model_key(&self) -> &str {
        self.client.model_name()
    }

    pub fn throttle_snapshot(&self) -> ThrottleState {
        self.throttle.lock().map(|t| *t).unwrap_or_default()
    }

    /// Resume accounting from persisted session state.
    pub fn restore_throttle(&self, state: ThrottleState) {
        if let Ok(mut t) = self.throttle.lock() {
            *t = state;
        }
    }

    pub fn check_throttle(&self) -> ThrottleDecision {
        self.check_throttle_at(Utc::now())
    }

    pub fn check_throttle_at(&self, now: DateTime<Utc>) -> ThrottleDecision {
        let state = self.throttle_snapshot();
        should_throttle(&state, &self.config, now)
    }

    /// Check the throttle and, if allowed, count a call.
    fn reserve_call(&self, now: DateTime<Utc>) -> ThrottleDecision {
        let Ok(mut state) = self.throttle.lock() else {
            return ThrottleDecision::SessionCap {
                used: self.config.max_per_session,
                max: self.config.max_per_session,
            };
        };
        let decision = should_throttle(&state, &self.config, now);
        if !decision.is_throttled() {
            state.call_count += 1;
            state.last_call = Some(now);
        }
        decision
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.lock().map(|mut c| c.cleanup()).unwrap_or(0)
    }

    fn cache_get(&self, hash: &str) -> Option<Analysis> {
        if !self.cache_enabled {
            return None;
        }
        self.cache.lock().ok()?.get(hash)
    }

    fn cache_put(&self, hash: &str, analysis: &Analysis) {
        if !self.cache_enabled {
            return;
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(hash, analysis);
        }
    }

    /// Analyze one error message. Never fails.
    pub async fn analyze(&self, message: &str) -> Analysis {
        let hash = hash_error(message);

        if let Some(hit) = self.cache_get(&hash) {
            debug!("[healer] Analysis cache hit for {}", &hash[..12]);
            return hit;
        }

        if let Some(analysis) = rule_based_analysis(message) {
            self.cache_put(&hash, &analysis);
            return analysis;
        }

        let decision = self.check_throttle();
        if let Some(reason) = decision.reason() {
            info!("[healer] LLM analysis skipped: {}", reason);
            return Analysis::throttled(&reason);
        }

        let key = self.model_key().to_string();
        let lease = match self.admission.acquire(&key, self.acquire_timeout).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("[healer] {}", e);
                return Analysis::throttled(&e.to_string());
            }
        };

        // Another caller may have spent the budget while we waited.
        if let Some(reason) = self.reserve_call(Utc::now()).reason() {
            info!("[healer] LLM analysis skipped: {}", reason);
            return Analysis::throttled(&reason);
        }

        info!("[healer] Requesting LLM analysis from {}", key);
        let reply = self.client.run_prompt(&build_prompt(message)).await;
        self.admission.release(lease);

        match reply {
            Ok(text) => match parse_llm_response(&text) {
                Some(analysis) => {
                    self.cache_put(&hash, &analysis);
                    analysis
                }
                None => {
                    warn!("[healer] LLM reply was not valid analysis JSON");
                    rule_based_analysis(message).unwrap_or_else(Analysis::fallback)
                }
            },
            Err(e) => {
                warn!("[healer] LLM call failed: {}", e);
                rule_based_analysis(message).unwrap_or_else(Analysis::fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use crate::llm::MockLlmClient;
    use chrono::Duration as ChronoDuration;

    const GOOD_REPLY: &str = r#"Here you go:
{"rootCause": "Worker ran out of memory", "suggestedFixes": ["Raise the heap limit"], "confidence": 0.8}
"#;

    fn analyzer_with(client: Arc<MockLlmClient>, config: LlmConfig) -> LlmAnalyzer {
        LlmAnalyzer::new(
            client,
            Arc::new(AdmissionController::new(ConcurrencyConfig::default())),
            Duration::from_millis(200),
            config,
            &CacheConfig::default(),
            AnalysisCache::in_memory(86_400_000),
        )
    }

    #[test]
    fn test_hash_ignores_dates_times_and_paths() {
        let a = "2024-01-05 10:20:30 ERROR worker crashed reading /home/alice/app/data.db";
        let b = "2025-12-31 23:59:59 ERROR worker crashed reading /srv/build/other/x.db";
        assert_eq!(hash_error(a), hash_error(b));
        assert_ne!(hash_error(a), hash_error("ERROR worker exited"));
    }

    #[test]
    fn test_hash_is_deterministic_and_case_insensitive() {
        let msg = "Segmentation Fault in module";
        assert_eq!(hash_error(msg), hash_error(msg));
        assert_eq!(hash_error(msg), hash_error("segmentation fault   in MODULE"));
        assert_eq!(hash_error(msg).len(), 64);
    }

    #[test]
    fn test_normalize_truncates() {
        let long = "x".repeat(2_000);
        assert_eq!(normalize_error(&long).chars().count(), MAX_NORMALIZED_LEN);
        assert_eq!(normalize_error("at 12:00:01 in /tmp/a"), "at TIME in PATH");
    }

    #[test]
    fn test_rules() {
        let enoent = rule_based_analysis("Error: ENOENT: no such file").unwrap();
        assert_eq!(enoent.root_cause, "File or resource not found");
        assert_eq!(enoent.confidence, 0.9);

        assert_eq!(rule_based_analysis("module not found").unwrap().confidence, 0.8);
        assert_eq!(rule_based_analysis("EACCES on socket").unwrap().root_cause, "Permission denied");
        assert_eq!(rule_based_analysis("connect ETIMEDOUT").unwrap().confidence, 0.9);
        assert_eq!(rule_based_analysis("request timeout").unwrap().confidence, 0.7);
        assert_eq!(rule_based_analysis("HTTP 429").unwrap().root_cause, "Rate limit exceeded");
        assert!(rule_based_analysis("segfault in worker").is_none());
    }

    #[test]
    fn test_throttle_session_cap() {
        let config = LlmConfig::default();
        let state = ThrottleState {
            call_count: config.max_per_session,
            last_call: None,
        };
        let decision = should_throttle(&state, &config, Utc::now());
        assert!(matches!(decision, ThrottleDecision::SessionCap { .. }));
        assert!(decision.reason().unwrap().contains("session limit"));
    }

    #[test]
    fn test_throttle_cooldown() {
        let config = LlmConfig::default();
        let now = Utc::now();
        let state = ThrottleState {
            call_count: 1,
            last_call: Some(now - ChronoDuration::seconds(60)),
        };
        let decision = should_throttle(&state, &config, now);
        match decision {
            ThrottleDecision::Cooldown { remaining } => assert_eq!(remaining.as_secs(), 240),
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert!(decision.reason().unwrap().contains("cooldown"));

        let later = now + ChronoDuration::seconds(240);
        assert_eq!(should_throttle(&state, &config, later), ThrottleDecision::Allowed);
    }

    #[test]
    fn test_parse_llm_response() {
        let parsed = parse_llm_response(GOOD_REPLY).unwrap();
        assert_eq!(parsed.root_cause, "Worker ran out of memory");
        assert_eq!(parsed.source, AnalysisSource::Llm);

        assert!(parse_llm_response("no json at all").is_none());
        assert!(parse_llm_response("{ broken").is_none());
        assert!(parse_llm_response(r#"{"rootCause": ""}"#).is_none());
        let clamped = parse_llm_response(r#"{"rootCause":"x","confidence":7}"#).unwrap();
        assert_eq!(clamped.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_rules_short_circuit_paid_call() {
        let client = Arc::new(MockLlmClient::new().with_response(GOOD_REPLY));
        let analyzer = analyzer_with(Arc::clone(&client), LlmConfig::default());

        let first = analyzer.analyze("ENOENT: open config.yml").await;
        assert_eq!(first.source, AnalysisSource::Rules);
        let second = analyzer.analyze("ENOENT: open config.yml").await;
        assert!(second.cached);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_paid_call_is_cached_and_counted() {
        let client = Arc::new(MockLlmClient::new().with_response(GOOD_REPLY));
        let analyzer = analyzer_with(Arc::clone(&client), LlmConfig::default());

        let first = analyzer.analyze("worker exploded at 10:00:00").await;
        assert_eq!(first.source, AnalysisSource::Llm);
        assert_eq!(analyzer.throttle_snapshot().call_count, 1);

        let second = analyzer.analyze("worker exploded at 11:30:00").await;
        assert!(second.cached);
        assert_eq!(second.root_cause, first.root_cause);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_throttled_does_not_increment() {
        let client = Arc::new(MockLlmClient::new().with_response(GOOD_REPLY));
        let analyzer = analyzer_with(Arc::clone(&client), LlmConfig::default());

        analyzer.analyze("first unknown problem").await;
        let throttled = analyzer.analyze("second unknown problem").await;
        assert!(throttled.is_throttled());
        assert_eq!(throttled.confidence, 0.1);
        assert_eq!(analyzer.throttle_snapshot().call_count, 1);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_call_degrades_and_is_not_cached() {
        let client = Arc::new(MockLlmClient::new().with_error("boom"));
        let config = LlmConfig {
            cooldown_ms: 0,
            ..LlmConfig::default()
        };
        let analyzer = analyzer_with(Arc::clone(&client), config);

        let result = analyzer.analyze("mysterious crash").await;
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert_eq!(analyzer.cache_len(), 0);
        assert_eq!(analyzer.throttle_snapshot().call_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_degrades() {
        let client = Arc::new(MockLlmClient::new().with_response("I think it is a bug."));
        let analyzer = analyzer_with(Arc::clone(&client), LlmConfig::default());
        let result = analyzer.analyze("mysterious crash").await;
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert!(!result.root_cause.is_empty());
    }

    #[tokio::test]
    async fn test_admission_timeout_yields_throttled() {
        let client = Arc::new(
            MockLlmClient::new()
                .with_response(GOOD_REPLY)
                .with_delay(Duration::from_millis(500)),
        );
        let config = LlmConfig {
            cooldown_ms: 0,
            ..LlmConfig::default()
        };
        let analyzer = Arc::new(LlmAnalyzer::new(
            client.clone(),
            Arc::new(AdmissionController::new(ConcurrencyConfig::default())),
            Duration::from_millis(50),
            config,
            &CacheConfig::default(),
            AnalysisCache::in_memory(86_400_000),
        ));

        let slow = {
            let analyzer = Arc::clone(&analyzer);
            tokio::spawn(async move { analyzer.analyze("first mystery").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let blocked = analyzer.analyze("second mystery").await;

        assert!(blocked.is_throttled());
        assert!(blocked.root_cause.contains("Admission timeout"));
        assert_eq!(slow.await.unwrap().source, AnalysisSource::Llm);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_throttle() {
        let client = Arc::new(MockLlmClient::new().with_response(GOOD_REPLY));
        let analyzer = analyzer_with(Arc::clone(&client), LlmConfig::default());
        analyzer.restore_throttle(ThrottleState {
            call_count: 10,
            last_call: None,
        });
        assert!(analyzer.analyze("unseen failure").await.is_throttled());
        assert_eq!(client.call_count(), 0);
    }
}
