//! Post-remediation verification.
//!
//! A verification runs an ordered battery of checks and passes only when
//! every *required* check passed. Command checks (BUILD, TEST, LINT) shell
//! out with a per-check timeout; ERROR_FREE scans the tail of the monitored
//! log; FUNCTIONALITY and ARCHITECT need a human reviewer and pass as-is.
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_healer::verify::VerificationEngine;
//!
//! let engine = VerificationEngine::new(".", config.verification.clone())
//!     .with_log(".ralph/loop.log");
//! let result = engine.verify("prd stub created").await;
//! if !result.passed {
//!     eprintln!("failed: {:?}", result.failed_checks);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::VerificationConfig;

/// Lines of log inspected by the ERROR_FREE check.
const ERROR_SCAN_LINES: usize = 100;

/// Captured command output kept per check.
const MAX_OUTPUT_CHARS: usize = 4_000;

/// Error-like tokens for the ERROR_FREE scan.
const LOG_ERROR_TOKEN: &str = r"(?i)\b(?:error|exception|fatal|panic(?:ked)?|failed)\b";

// ============================================================================
// Check definitions
// ============================================================================

/// Kinds of verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    Build,
    Test,
    Lint,
    ErrorFree,
    Functionality,
    Architect,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "BUILD",
            Self::Test => "TEST",
            Self::Lint => "LINT",
            Self::ErrorFree => "ERROR_FREE",
            Self::Functionality => "FUNCTIONALITY",
            Self::Architect => "ARCHITECT",
        }
    }

    /// Checks that run an external command.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Build | Self::Test | Self::Lint)
    }

    /// Checks that need a human reviewer.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Functionality | Self::Architect)
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(rename = "type")]
    pub check: CheckType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl CheckSpec {
    pub fn required(check: CheckType) -> Self {
        Self {
            check,
            required: true,
        }
    }

    pub fn optional(check: CheckType) -> Self {
        Self {
            check,
            required: false,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCheckResult {
    pub check: CheckType,
    pub required: bool,
    pub passed: bool,
    /// Nothing to run for this project; counted as passed.
    #[serde(default)]
    pub skipped: bool,
    pub output: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub claim: String,
    pub passed: bool,
    pub checks: Vec<VerificationCheckResult>,
    /// Every check that failed, required or not.
    pub failed_checks: Vec<CheckType>,
    pub timestamp: DateTime<Utc>,
}

impl VerificationResult {
    fn from_checks(claim: &str, checks: Vec<VerificationCheckResult>) -> Self {
        let passed = checks.iter().filter(|c| c.required).all(|c| c.passed);
        let failed_checks = checks.iter().filter(|c| !c.passed).map(|c| c.check).collect();
        Self {
            claim: claim.to_string(),
            passed,
            checks,
            failed_checks,
            timestamp: Utc::now(),
        }
    }

    pub fn evidence(&self) -> Evidence {
        Evidence {
            claim: self.claim.clone(),
            passed: self.passed,
            timestamp: self.timestamp,
        }
    }

    pub fn summary(&self) -> String {
        let passed = self.checks.iter().filter(|c| c.passed).count();
        format!(
            "{} ({}/{} checks passed)",
            if self.passed { "PASSED" } else { "FAILED" },
            passed,
            self.checks.len()
        )
    }
}

/// Proof that a claim was verified at some instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub claim: String,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Engine
// ============================================================================

/// Runs verification checks for one project.
#[derive(Debug, Clone)]
pub struct VerificationEngine {
    project_dir: PathBuf,
    config: VerificationConfig,
    log_path: Option<PathBuf>,
}

impl VerificationEngine {
    pub fn new(project_dir: impl Into<PathBuf>, config: VerificationConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
            log_path: None,
        }
    }

    /// Log file scanned by ERROR_FREE.
    #[must_use]
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn is_evidence_fresh(&self, evidence: &Evidence) -> bool {
        self.is_evidence_fresh_at(evidence, Utc::now())
    }

    /// Evidence is fresh while younger than the freshness TTL.
    pub fn is_evidence_fresh_at(&self, evidence: &Evidence, now: DateTime<Utc>) -> bool {
        let age = now - evidence.timestamp;
        age < chrono::Duration::milliseconds(self.config.freshness_ttl_ms as i64)
    }

    /// Command for a check: configured first, then discovered from the
    /// project layout.
    pub fn command_for(&self, check: CheckType) -> Option<String> {
        if let Some(cmd) = self.config.commands.get(&check) {
            return Some(cmd.clone());
        }
        discover_command(&self.project_dir, check).map(str::to_string)
    }

    /// Current byte length of the log, or 0 when there is none.
    ///
    /// Pass it to [`verify_since`](Self::verify_since) to limit ERROR_FREE
    /// to lines written afterwards.
    pub fn log_len(&self) -> u64 {
        self.log_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Run every configured check against `claim`.
    pub async fn verify(&self, claim: &str) -> VerificationResult {
        self.verify_since(claim, None).await
    }

    /// Like [`verify`](Self::verify), but ERROR_FREE only looks at log
    /// bytes past `log_offset`.
    pub async fn verify_since(&self, claim: &str, log_offset: Option<u64>) -> VerificationResult {
        info!(
            "[healer] Verifying '{}' ({} checks)",
            claim,
            self.config.checks.len()
        );

        let checks = if self.config.parallel {
            join_all(
                self.config
                    .checks
                    .iter()
                    .map(|spec| self.run_check_since(spec, log_offset)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(self.config.checks.len());
            for spec in &self.config.checks {
                results.push(self.run_check_since(spec, log_offset).await);
            }
            results
        };

        let result = VerificationResult::from_checks(claim, checks);
        info!("[healer] Verification {}", result.summary());
        result
    }

    /// Run a single check.
    pub async fn run_check(&self, spec: &CheckSpec) -> VerificationCheckResult {
        self.run_check_since(spec, None).await
    }

    async fn run_check_since(&self, spec: &CheckSpec, log_offset: Option<u64>) -> VerificationCheckResult {
        let start = Instant::now();
        let (passed, skipped, output) = match spec.check {
            CheckType::Build | CheckType::Test | CheckType::Lint => match self.command_for(spec.check) {
                Some(cmd) => {
                    let (passed, output) = self.run_command(&cmd).await;
                    (passed, false, output)
                }
                None => (
                    true,
                    true,
                    format!("no {} command configured or discovered", spec.check),
                ),
            },
            CheckType::ErrorFree => {
                let (passed, output) = self.scan_log(log_offset);
                (passed, false, output)
            }
            CheckType::Functionality | CheckType::Architect => (
                true,
                true,
                "manual check, no reviewer configured".to_string(),
            ),
        };

        debug!(
            "[healer] Check {} {}",
            spec.check,
            if passed { "passed" } else { "failed" }
        );

        VerificationCheckResult {
            check: spec.check,
            required: spec.required,
            passed,
            skipped,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    async fn run_command(&self, cmd: &str) -> (bool, String) {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                (output.status.success(), tail_chars(&text, MAX_OUTPUT_CHARS))
            }
            Ok(Err(e)) => {
                warn!("[healer] Could not run '{}': {}", cmd, e);
                (false, format!("failed to run '{cmd}': {e}"))
            }
            Err(_) => {
                warn!("[healer] '{}' timed out after {}ms", cmd, timeout.as_millis());
                (false, format!("'{cmd}' timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    /// Scan the last lines of the log for error tokens, ignoring the
    /// healer's own output. With an offset only later bytes count; a log
    /// shorter than the offset was truncated and is scanned whole.
    fn scan_log(&self, log_offset: Option<u64>) -> (bool, String) {
        let Some(path) = &self.log_path else {
            return (true, "no log file configured".to_string());
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return (false, format!("cannot read {}: {}", path.display(), e));
            }
        };
        let start = log_offset
            .and_then(|offset| usize::try_from(offset).ok())
            .filter(|&offset| offset <= bytes.len())
            .unwrap_or(0);
        let content = String::from_utf8_lossy(&bytes[start..]);

        let offending = find_error_lines(&content);
        if offending.is_empty() {
            (true, format!("no errors in last {ERROR_SCAN_LINES} log lines"))
        } else {
            (
                false,
                format!(
                    "{} error line(s) in log:\n{}",
                    offending.len(),
                    offending.join("\n")
                ),
            )
        }
    }
}

/// Error-like lines among the last [`ERROR_SCAN_LINES`] of `content`.
pub fn find_error_lines(content: &str) -> Vec<String> {
    let Ok(token) = Regex::new(LOG_ERROR_TOKEN) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(ERROR_SCAN_LINES);
    lines[start..]
        .iter()
        .filter(|line| !is_healer_chatter(line))
        .filter(|line| token.is_match(line))
        .map(|line| line.to_string())
        .collect()
}

fn is_healer_chatter(line: &str) -> bool {
    if line.contains("[healer]") {
        return true;
    }
    let lower = line.to_lowercase();
    lower.contains("self-heal") || lower.contains("healing")
}

fn discover_command(project_dir: &Path, check: CheckType) -> Option<&'static str> {
    if project_dir.join("Cargo.toml").exists() {
        return match check {
            CheckType::Build => Some("cargo build"),
            CheckType::Test => Some("cargo test"),
            CheckType::Lint => Some("cargo clippy -- -D warnings"),
            _ => None,
        };
    }
    if project_dir.join("package.json").exists() {
        return match check {
            CheckType::Build => Some("npm run build"),
            CheckType::Test => Some("npm test"),
            CheckType::Lint => Some("npm run lint"),
            _ => None,
        };
    }
    None
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}
