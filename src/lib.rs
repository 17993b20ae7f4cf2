//! Ralph Healer - self-healing supervisor for the Ralph automation loop
//!
//! Tails the loop's execution log, classifies failures as they appear and
//! applies a known fix, pauses the loop, or escalates to an LLM diagnosis.
//! A circuit breaker, a paid-call throttle and per-key admission control
//! keep remediation from cascading or running up API spend.
//!
//! # Architecture
//!
//! - [`tailer`] - Incremental log reader (filesystem watch + poll)
//! - [`patterns`] - Regex failure classifier
//! - [`actions`] - Action decision table, executors and pause control
//! - [`circuit`] - Circuit breaker over remediation outcomes
//! - [`admission`] - Per-key concurrency limits for external calls
//! - [`analyzer`] - LLM fallback analysis with cache and throttle
//! - [`llm`] - LLM client seam (Claude CLI, mock)
//! - [`wisdom`] - Learned fixes with trust threshold and expiry
//! - [`verify`] - Build/test/lint/log verification checks
//! - [`recovery`] - Early-exit diagnosis and task enhancement
//! - [`monitor`] - Orchestrator and persisted session state
//! - [`events`] - Broadcast notifications
//! - [`config`] - `healer.json` configuration and state paths
//! - [`error`] - Error types
//! - [`testing`] - Test doubles for the task backend and remediations
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ralph_healer::{ClaudeClient, HealerConfig, Monitor, StatePaths};
//!
//! let root = std::path::Path::new(".");
//! let config = HealerConfig::load(root)?;
//! let client = Arc::new(ClaudeClient::new(root).with_model(&config.llm.model));
//! let monitor = Arc::new(Monitor::new(root, StatePaths::for_project(root), config, client));
//!
//! let handle = monitor.watch(std::path::Path::new(".ralph/loop.log"))?;
//! handle.wait().await;
//! ```

pub mod actions;
pub mod admission;
pub mod analyzer;
pub mod circuit;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod monitor;
pub mod patterns;
pub mod persist;
pub mod recovery;
pub mod tailer;
pub mod testing;
pub mod verify;
pub mod wisdom;

// Re-export commonly used types
pub use error::{HealerError, Result};

pub use config::{HealerConfig, StatePaths};

pub use actions::{
    Action, ActionDispatcher, ActionKind, ActionResult, ActionStats, CreatePrdStub,
    PauseController, PauseState, Remediation,
};
pub use admission::{AdmissionController, Lease};
pub use analyzer::{hash_error, normalize_error, Analysis, AnalysisCache, LlmAnalyzer};
pub use circuit::{CircuitBreaker, CircuitState};
pub use events::{EventBus, MonitorEvent};
pub use llm::{ClaudeClient, LlmClient, MockLlmClient};
pub use monitor::{HealthReport, Monitor, MonitorHandle, MonitorState, TaskContext};
pub use patterns::{PatternClassifier, PatternKind, PatternMatch, Severity};
pub use recovery::{ExitReason, RecoveryAnalysis, RecoveryAnalyzer, TaskBackend};
pub use tailer::{LogLine, LogTailer, TailEvent, TailerConfig, TailerHandle};
pub use verify::{CheckType, VerificationEngine, VerificationResult};
pub use wisdom::{WisdomStats, WisdomStore};
