//! Custom error types for the healer.
//!
//! Most environmental failures never reach callers: they are logged and
//! replaced with a safe default at the component edge. The variants here
//! cover what remains - configuration problems, contract violations, and
//! the handful of conditions a caller can act on.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for healer operations
#[derive(Error, Debug)]
pub enum HealerError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Tailing Errors
    // =========================================================================
    /// The log file could not be watched or read
    #[error("Tailer error on {path}: {message}")]
    Tailer { path: PathBuf, message: String },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// Admission controller could not grant a lease in time
    #[error("Admission timeout for '{key}' after {timeout_ms}ms")]
    AdmissionTimeout { key: String, timeout_ms: u64 },

    // =========================================================================
    // Action Errors
    // =========================================================================
    /// An action was handed to the executor for a different variant
    #[error("Wrong action variant: expected {expected}, got {actual}")]
    WrongActionVariant { expected: String, actual: String },

    /// A remediation refused to run or failed
    #[error("Remediation '{name}' failed: {message}")]
    Remediation { name: String, message: String },

    // =========================================================================
    // External Collaborator Errors
    // =========================================================================
    /// LLM call failed
    #[error("LLM error: {message}")]
    Llm { message: String },

    /// Task backend call failed
    #[error("Task backend error: {message}")]
    TaskBackend { message: String },

    /// State file lock could not be acquired
    #[error("State lock error: {message}")]
    Lock { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HealerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a tailer error
    pub fn tailer(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Tailer {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a wrong-variant error
    pub fn wrong_variant(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::WrongActionVariant {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a remediation error
    pub fn remediation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remediation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a task backend error
    pub fn task_backend(message: impl Into<String>) -> Self {
        Self::TaskBackend {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is an environmental condition the monitor survives
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Tailer { .. }
                | Self::AdmissionTimeout { .. }
                | Self::Remediation { .. }
                | Self::Llm { .. }
                | Self::TaskBackend { .. }
                | Self::Lock { .. }
                | Self::Io(_)
                | Self::Json(_)
        )
    }

    /// Check if this error indicates a defect in the caller
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::WrongActionVariant { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::Tailer { .. } => 6,
            Self::WrongActionVariant { .. } => 70,
            _ => 1,
        }
    }
}

/// Type alias for healer results
pub type Result<T> = std::result::Result<T, HealerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HealerError::AdmissionTimeout {
            key: "claude-sonnet".into(),
            timeout_ms: 500,
        };
        assert!(err.to_string().contains("claude-sonnet"));
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn test_wrong_variant_is_contract_violation() {
        let err = HealerError::wrong_variant("pause", "notify");
        assert!(err.is_contract_violation());
        assert!(!err.is_recoverable());
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn test_environmental_errors_are_recoverable() {
        assert!(HealerError::tailer("/tmp/x.log", "gone").is_recoverable());
        assert!(HealerError::task_backend("offline").is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(HealerError::from(io).is_recoverable());
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/project/.ralph/healer.json");
        let err = HealerError::config_with_path("bad json", path.clone());
        if let HealerError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "bad json");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HealerError::config("x").exit_code(), 7);
        assert_eq!(HealerError::tailer("/a", "b").exit_code(), 6);
        assert_eq!(HealerError::task_backend("x").exit_code(), 1);
    }
}
