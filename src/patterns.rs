//! Failure pattern classification for log lines.
//!
//! The classifier walks a fixed, ordered table and returns the first entry
//! whose regex matches. Order encodes priority: `prd-not-found` sits before
//! the generic `file-not-found`, and `rate-limit` before `task-failed`, so a
//! line such as `Task 12 failed: 429 Too Many Requests` is handled as a rate
//! limit rather than a plain task failure.
//!
//! # Example
//!
//! ```rust
//! use ralph_healer::patterns::{PatternClassifier, PatternKind, Severity};
//!
//! let classifier = PatternClassifier::new();
//! let m = classifier.classify("Error: CLAUDE_API_KEY is required").unwrap();
//! assert_eq!(m.kind, PatternKind::EnvVarRequired);
//! assert_eq!(m.severity, Severity::Error);
//! assert_eq!(m.context.get("envVar").map(String::as_str), Some("CLAUDE_API_KEY"));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity attached to a classified line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Known failure categories, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    PrdNotFound,
    RateLimit,
    EnvVarRequired,
    TaskFailed,
    Timeout,
    NoPendingTasks,
    FileNotFound,
    PermissionDenied,
    NetworkError,
    PluginError,
    CircuitBreaker,
}

impl PatternKind {
    /// Stable kebab-case name used in logs, counters and persisted state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrdNotFound => "prd-not-found",
            Self::RateLimit => "rate-limit",
            Self::EnvVarRequired => "env-var-required",
            Self::TaskFailed => "task-failed",
            Self::Timeout => "timeout",
            Self::NoPendingTasks => "no-pending-tasks",
            Self::FileNotFound => "file-not-found",
            Self::PermissionDenied => "permission-denied",
            Self::NetworkError => "network-error",
            Self::PluginError => "plugin-error",
            Self::CircuitBreaker => "circuit-breaker",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of classifying a single log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub kind: PatternKind,
    pub severity: Severity,
    /// Values pulled out of capture groups (file path, env var, plugin name).
    pub context: BTreeMap<String, String>,
    pub line: String,
}

/// One row of the classification table.
struct PatternRule {
    kind: PatternKind,
    regex: Regex,
    severity: Severity,
    /// Context key for each capture group, by group index starting at 1.
    captures: &'static [&'static str],
}

/// Raw table: (kind, regex, severity, capture names).
const RULES: &[(PatternKind, &str, Severity, &[&str])] = &[
    (
        PatternKind::PrdNotFound,
        r"(?i)\bPRD(?: file)? not found:?\s*([^\s'`]+)?",
        Severity::Warn,
        &["path"],
    ),
    (
        PatternKind::RateLimit,
        r"(?i)\brate[ _-]?limit|\b429\b|too many requests",
        Severity::High,
        &[],
    ),
    (
        PatternKind::EnvVarRequired,
        r"\b([A-Z][A-Z0-9]*_[A-Z0-9_]+)\b(?:\s+environment variable)?\s+(?:is\s+)?(?:required|not set|missing)|(?i:missing (?:required )?environment variable):?\s*([A-Z][A-Z0-9_]{2,})",
        Severity::Error,
        &["envVar", "envVar"],
    ),
    (
        PatternKind::TaskFailed,
        r"(?i)\btask\b(?:\s+([A-Za-z]+-\d+|#?\d+))?[^\n]*?\bfail(?:ed|ure)\b",
        Severity::High,
        &["taskId"],
    ),
    (
        PatternKind::Timeout,
        r"(?i)\btimed? ?out\b|\bETIMEDOUT\b|\btimeout\b",
        Severity::Warn,
        &[],
    ),
    (
        PatternKind::NoPendingTasks,
        r"(?i)\bno (?:pending|remaining|more) tasks\b|\ball tasks (?:are )?(?:complete|completed|done)\b",
        Severity::Info,
        &[],
    ),
    (
        PatternKind::FileNotFound,
        r"(?i)(?:\bENOENT\b|no such file or directory|\bfile not found\b)(?:[^'/\n]*?'([^']+)'|:\s*(/[^\s,]+|\.{1,2}/[^\s,]+|[\w.-]+/[^\s,]+))?",
        Severity::Error,
        &["path", "path"],
    ),
    (
        PatternKind::PermissionDenied,
        r"(?i)(?:\bEACCES\b|\bEPERM\b|permission denied)(?:[^'/\n]*?'([^']+)'|:\s*(/[^\s,]+|\.{1,2}/[^\s,]+|[\w.-]+/[^\s,]+))?",
        Severity::Error,
        &["path", "path"],
    ),
    (
        PatternKind::NetworkError,
        r"(?i)\b(ECONNREFUSED|ECONNRESET|ENOTFOUND|EAI_AGAIN|network error|socket hang up|connection refused|connection reset)\b",
        Severity::Warn,
        &["code"],
    ),
    (
        PatternKind::PluginError,
        r#"(?i)\bplugin\s+['"\[]?([\w@./-]+?)['"\]]?\s*(?::\s*)?(?:failed|error|crashed|threw)|\bplugin error\b(?:\s*(?:in|from)\s+['"]?([\w@./-]+))?"#,
        Severity::Warn,
        &["plugin", "plugin"],
    ),
    (
        PatternKind::CircuitBreaker,
        r"(?i)\bcircuit[ -]breaker\b[^\n]*?\b(?:open|opened|tripped)\b",
        Severity::High,
        &[],
    ),
];

/// Generic error token test for lines no rule matched.
const ERROR_TOKEN: &str =
    r"(?i)error|exception|\bfail(?:s|ed|ure)?\b|\bcritical\b|\bfatal\b|\bpanic(?:ked)?\b";

/// Maps raw log lines to known failure patterns.
pub struct PatternClassifier {
    rules: Vec<PatternRule>,
    error_token: Option<Regex>,
}

impl std::fmt::Debug for PatternClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternClassifier")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternClassifier {
    /// Build the classifier with the built-in rule table.
    #[must_use]
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|(kind, source, severity, captures)| {
                Regex::new(source).ok().map(|regex| PatternRule {
                    kind: *kind,
                    regex,
                    severity: *severity,
                    captures: *captures,
                })
            })
            .collect();

        Self {
            rules,
            error_token: Regex::new(ERROR_TOKEN).ok(),
        }
    }

    /// Classify a line, returning the first matching pattern.
    #[must_use]
    pub fn classify(&self, line: &str) -> Option<PatternMatch> {
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };

            let mut context = BTreeMap::new();
            for (idx, name) in rule.captures.iter().enumerate() {
                if context.contains_key(*name) {
                    continue;
                }
                if let Some(value) = caps.get(idx + 1) {
                    let value = value.as_str().trim_end_matches(['.', ',', ')', ';']);
                    if !value.is_empty() {
                        context.insert((*name).to_string(), value.to_string());
                    }
                }
            }

            return Some(PatternMatch {
                kind: rule.kind,
                severity: rule.severity,
                context,
                line: line.to_string(),
            });
        }
        None
    }

    /// True when an unclassified line still looks like an error worth
    /// analyzing.
    #[must_use]
    pub fn is_unknown_error_candidate(&self, line: &str) -> bool {
        self.classify(line).is_none()
            && self
                .error_token
                .as_ref()
                .is_some_and(|re| re.is_match(line))
    }

    /// Regex source for a pattern kind, used to build wisdom signatures.
    #[must_use]
    pub fn regex_source(&self, kind: PatternKind) -> &str {
        self.rules
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.regex.as_str())
            .unwrap_or_default()
    }

    /// Number of rules in the table.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
