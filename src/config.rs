//! Configuration management for the healer.
//!
//! Configuration is read from `.ralph/healer.json` in the project directory.
//! Every field carries a serde default, so a partial file (or no file at all)
//! yields a usable configuration.
//!
//! # Example healer.json
//!
//! ```json
//! {
//!   "circuitBreaker": { "maxFailures": 5 },
//!   "llm": { "maxPerSession": 4, "model": "haiku" },
//!   "verification": {
//!     "commands": { "TEST": "cargo test --lib" }
//!   }
//! }
//! ```

use crate::error::{HealerError, Result};
use crate::verify::{CheckSpec, CheckType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory (relative to the project root) holding all healer state files.
pub const STATE_DIR: &str = ".ralph/healer";

/// Config file location relative to the project root.
pub const CONFIG_FILE: &str = ".ralph/healer.json";

// ============================================================================
// State paths
// ============================================================================

/// Locations of the persisted JSON documents.
///
/// Built once at startup and handed to each component that persists state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub wisdom_file: PathBuf,
    pub cache_file: PathBuf,
    pub monitor_state_file: PathBuf,
    pub pause_file: PathBuf,
}

impl StatePaths {
    /// State paths rooted at `<project_root>/.ralph/healer/`.
    #[must_use]
    pub fn for_project(project_root: &Path) -> Self {
        Self::in_dir(&project_root.join(STATE_DIR))
    }

    /// State paths inside an explicit directory.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            wisdom_file: dir.join("wisdom.json"),
            cache_file: dir.join("llm-cache.json"),
            monitor_state_file: dir.join("monitor-state.json"),
            pause_file: dir.join("pause-state.json"),
        }
    }
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::in_dir(Path::new(STATE_DIR))
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_cooldown_period_ms")]
    pub cooldown_period_ms: u64,

    /// Consecutive successes needed in half-open before closing.
    #[serde(default = "default_half_open_attempts")]
    pub half_open_attempts: u32,
}

fn default_max_failures() -> u32 {
    3
}

fn default_cooldown_period_ms() -> u64 {
    60_000
}

fn default_half_open_attempts() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            cooldown_period_ms: default_cooldown_period_ms(),
            half_open_attempts: default_half_open_attempts(),
        }
    }
}

/// Verification engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfig {
    /// Maximum age of evidence that may be trusted without re-running checks.
    #[serde(default = "default_freshness_ttl_ms", alias = "freshnessTTL")]
    pub freshness_ttl_ms: u64,

    /// Ordered checks to run.
    #[serde(default = "default_checks")]
    pub checks: Vec<CheckSpec>,

    /// Per-check timeout for command-based checks.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Run command checks concurrently.
    #[serde(default)]
    pub parallel: bool,

    /// Explicit commands per check type; missing entries are discovered
    /// from the project layout.
    #[serde(default)]
    pub commands: BTreeMap<CheckType, String>,
}

fn default_freshness_ttl_ms() -> u64 {
    300_000
}

fn default_checks() -> Vec<CheckSpec> {
    vec![
        CheckSpec::required(CheckType::Build),
        CheckSpec::required(CheckType::Test),
        CheckSpec::optional(CheckType::Lint),
        CheckSpec::required(CheckType::ErrorFree),
    ]
}

fn default_command_timeout_ms() -> u64 {
    120_000
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            freshness_ttl_ms: default_freshness_ttl_ms(),
            checks: default_checks(),
            command_timeout_ms: default_command_timeout_ms(),
            parallel: false,
            commands: BTreeMap::new(),
        }
    }
}

/// Wisdom store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WisdomConfig {
    #[serde(default = "default_pattern_expiry_days")]
    pub pattern_expiry_days: u32,

    #[serde(default = "default_min_success_for_trust")]
    pub min_success_for_trust: u32,
}

fn default_pattern_expiry_days() -> u32 {
    30
}

fn default_min_success_for_trust() -> u32 {
    3
}

impl Default for WisdomConfig {
    fn default() -> Self {
        Self {
            pattern_expiry_days: default_pattern_expiry_days(),
            min_success_for_trust: default_min_success_for_trust(),
        }
    }
}

/// Paid LLM fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Minimum time between two paid calls.
    #[serde(default = "default_llm_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Paid calls allowed per monitor session.
    #[serde(default = "default_max_per_session")]
    pub max_per_session: u32,

    /// Model variant passed to the Claude CLI.
    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout for a single paid call.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_cooldown_ms() -> u64 {
    300_000
}

fn default_max_per_session() -> u32 {
    10
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_llm_cooldown_ms(),
            max_per_session: default_max_per_session(),
            model: default_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// LLM analysis cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_cache_ttl_ms() -> u64 {
    86_400_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

/// Log monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Analyze each distinct unknown error only once per session.
    #[serde(default = "default_true")]
    pub cache_unknown_errors: bool,

    /// Run verification after every auto-fix.
    #[serde(default = "default_true")]
    pub verify_after_fix: bool,
}

fn default_polling_interval_ms() -> u64 {
    2_000
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            debounce_ms: default_debounce_ms(),
            cache_unknown_errors: true,
            verify_after_fix: true,
        }
    }
}

/// Session health timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_stale_detection_ms")]
    pub stale_detection_ms: u64,

    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_stale_detection_ms() -> u64 {
    180_000
}

fn default_max_lifetime_ms() -> u64 {
    1_800_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_detection_ms: default_stale_detection_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

/// Per-key concurrency limits for external calls.
///
/// Resolution order for a key: `modelLimits[key]`, then
/// `providerLimits[provider(key)]`, then `defaultLimit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    #[serde(default = "default_concurrency_limit")]
    pub default_limit: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default)]
    pub provider_limits: HashMap<String, usize>,

    #[serde(default)]
    pub model_limits: HashMap<String, usize>,
}

fn default_concurrency_limit() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_concurrency_limit(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            provider_limits: HashMap::new(),
            model_limits: HashMap::new(),
        }
    }
}

/// Pause safety limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PauseConfig {
    #[serde(default = "default_max_pause_ms")]
    pub max_pause_ms: u64,
}

fn default_max_pause_ms() -> u64 {
    300_000
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            max_pause_ms: default_max_pause_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Root config
// ============================================================================

/// Full healer configuration loaded from `.ralph/healer.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealerConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub wisdom: WisdomConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub pause: PauseConfig,
}

impl HealerConfig {
    /// Load configuration from a project directory
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file exists but cannot be read
    /// or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| HealerError::config_with_path(e.to_string(), path.clone()))?;
        serde_json::from_str(&content)
            .map_err(|e| HealerError::config_with_path(e.to_string(), path.clone()))
    }

    /// Get the healer.json path for a project
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_FILE)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let positive = [
            ("circuitBreaker.maxFailures", self.circuit_breaker.max_failures as u64),
            ("circuitBreaker.halfOpenAttempts", self.circuit_breaker.half_open_attempts as u64),
            ("wisdom.patternExpiryDays", self.wisdom.pattern_expiry_days as u64),
            ("wisdom.minSuccessForTrust", self.wisdom.min_success_for_trust as u64),
            ("cache.ttlMs", self.cache.ttl_ms),
            ("monitoring.pollingIntervalMs", self.monitoring.polling_interval_ms),
            ("health.healthCheckIntervalMs", self.health.health_check_interval_ms),
            ("health.maxLifetimeMs", self.health.max_lifetime_ms),
            ("verification.commandTimeoutMs", self.verification.command_timeout_ms),
            ("concurrency.defaultLimit", self.concurrency.default_limit as u64),
            ("llm.timeoutSecs", self.llm.timeout_secs),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(format!("{} must be greater than zero", field));
            }
        }

        if self.llm.model.trim().is_empty() {
            return Err("llm.model must not be empty".to_string());
        }

        for (key, limit) in self
            .concurrency
            .provider_limits
            .iter()
            .chain(self.concurrency.model_limits.iter())
        {
            if *limit == 0 {
                return Err(format!("concurrency limit for '{}' must be greater than zero", key));
            }
        }

        if self.verification.checks.is_empty() {
            return Err("verification.checks must list at least one check".to_string());
        }

        Ok(())
    }
}
