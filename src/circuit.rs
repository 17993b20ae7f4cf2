//! Circuit breaker guarding remediation actions.
//!
//! ```text
//!            failures >= max                 cooldown elapsed
//!  Closed ───────────────────────> Open ───────────────────────> HalfOpen
//!    ^                              ^  (checked in can_proceed)     │
//!    │        success x N           │          failure              │
//!    └──────────────────────────────┼───────────────────────────────┤
//!                                   └───────────────────────────────┘
//! ```
//!
//! The whole breaker (configuration included) serializes into the monitor
//! state file and is restored verbatim on restart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tracks consecutive remediation failures and gates further actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    max_failures: u32,
    cooldown_period_ms: u64,
    #[serde(default = "default_half_open_attempts")]
    half_open_attempts: u32,
    #[serde(default)]
    half_open_successes: u32,
}

fn default_half_open_attempts() -> u32 {
    1
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a closed breaker from configuration.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            max_failures: config.max_failures.max(1),
            cooldown_period_ms: config.cooldown_period_ms,
            half_open_attempts: config.half_open_attempts.max(1),
            half_open_successes: 0,
        }
    }

    /// Current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Timestamp of the most recent failure.
    #[must_use]
    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.last_failure_time
    }

    /// Whether an action may run now.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open here.
    pub fn can_proceed(&mut self) -> bool {
        self.can_proceed_at(Utc::now())
    }

    /// [`can_proceed`](Self::can_proceed) against an explicit clock.
    pub fn can_proceed_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.cooldown_remaining_at(now).is_zero() {
                    info!("[healer] Circuit breaker cooldown elapsed, entering half-open");
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before an open breaker allows a trial action.
    #[must_use]
    pub fn cooldown_remaining_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        if self.state != CircuitState::Open {
            return std::time::Duration::ZERO;
        }
        let Some(last) = self.last_failure_time else {
            return std::time::Duration::ZERO;
        };
        let ready_at = last + Duration::milliseconds(self.cooldown_period_ms as i64);
        (ready_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// Record a successful action.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.half_open_attempts {
                info!("[healer] Circuit breaker closed after successful trial");
                self.state = CircuitState::Closed;
                self.half_open_successes = 0;
            }
        }
    }

    /// Record a failed action.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock.
    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.max_failures {
                    warn!(
                        "[healer] Circuit breaker opened after {} consecutive failures",
                        self.consecutive_failures
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("[healer] Trial action failed, circuit breaker re-opened");
                self.state = CircuitState::Open;
                self.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear counters.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.last_failure_time = None;
    }
}
