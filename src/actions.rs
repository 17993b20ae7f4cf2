//! Remediation actions: deciding, executing, and bookkeeping.
//!
//! [`ActionDispatcher::decide`] maps a classified pattern to an [`Action`]
//! through a fixed table. [`ActionDispatcher::execute`] matches on the
//! action variant and hands it to the matching executor. Every execution
//! lands in an append-only history and in aggregate counters.
//!
//! The per-variant executors are public. Handing one the wrong variant is a
//! caller defect and returns [`HealerError::WrongActionVariant`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::analyzer::LlmAnalyzer;
use crate::error::{HealerError, Result};
use crate::events::{EventBus, MonitorEvent};
use crate::patterns::{PatternKind, PatternMatch, Severity};
use crate::persist::{load_json_or_default, save_json_atomic};
use crate::recovery::{RecoveryAnalysis, RecoveryAnalyzer, TaskBackend};

/// Pause requested for rate limits.
pub const RATE_LIMIT_PAUSE_MS: u64 = 60_000;

/// Name of the built-in PRD stub remediation.
pub const CREATE_PRD_STUB: &str = "create-prd-stub";

/// Pattern name used for actions raised on unclassified lines.
pub const UNKNOWN_PATTERN: &str = "unknown";

// ============================================================================
// Actions
// ============================================================================

/// Variant-specific part of an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionKind {
    #[serde(rename_all = "camelCase")]
    AutoFix { fix: String },
    #[serde(rename_all = "camelCase")]
    Pause { duration_ms: u64, reason: String },
    #[serde(rename_all = "camelCase")]
    Notify { message: String, severity: Severity },
    #[serde(rename_all = "camelCase")]
    Analyze { error_message: String },
    #[serde(rename_all = "camelCase")]
    EnhanceTask { analysis: Box<RecoveryAnalysis> },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AutoFix { .. } => "auto-fix",
            Self::Pause { .. } => "pause",
            Self::Notify { .. } => "notify",
            Self::Analyze { .. } => "analyze",
            Self::EnhanceTask { .. } => "enhance-task",
        }
    }
}

/// A remediation directive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub pattern: String,
    pub context: BTreeMap<String, String>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action: String,
    pub pattern: String,
    pub success: bool,
    /// Not executed because the circuit breaker was open.
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActionResult {
    fn ok(action: &Action, details: Option<serde_json::Value>) -> Self {
        Self {
            action: action.name().to_string(),
            pattern: action.pattern.clone(),
            success: true,
            blocked: false,
            error: None,
            timestamp: Utc::now(),
            details,
        }
    }

    fn failed(action: &Action, error: impl Into<String>) -> Self {
        Self {
            action: action.name().to_string(),
            pattern: action.pattern.clone(),
            success: false,
            blocked: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
            details: None,
        }
    }

    fn blocked(action: &Action) -> Self {
        Self {
            action: action.name().to_string(),
            pattern: action.pattern.clone(),
            success: false,
            blocked: true,
            error: Some("circuit breaker open".to_string()),
            timestamp: Utc::now(),
            details: None,
        }
    }

    /// A throttled analysis: succeeded, but should not feed the breaker.
    pub fn is_throttled(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get("throttled"))
            .and_then(|t| t.as_bool())
            .unwrap_or(false)
    }
}

/// Aggregate counters over the action history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStats {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    pub blocked: u32,
    pub by_type: BTreeMap<String, u32>,
    pub by_pattern: BTreeMap<String, u32>,
}

impl ActionStats {
    fn record(&mut self, result: &ActionResult) {
        self.total += 1;
        if result.blocked {
            self.blocked += 1;
        } else if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        *self.by_type.entry(result.action.clone()).or_default() += 1;
        *self.by_pattern.entry(result.pattern.clone()).or_default() += 1;
    }
}

// ============================================================================
// Remediations
// ============================================================================

/// A named fix the dispatcher can run for `auto-fix` actions.
#[async_trait]
pub trait Remediation: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the fix. Returns a short description of what was done.
    ///
    /// # Errors
    ///
    /// Returns an error if the fix could not be applied.
    async fn apply(&self, action: &Action) -> anyhow::Result<String>;
}

/// Writes a skeleton PRD at the path a `prd-not-found` line named.
#[derive(Debug, Clone)]
pub struct CreatePrdStub {
    project_root: PathBuf,
}

impl CreatePrdStub {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Resolve `raw` under the project root, rejecting escapes.
    fn resolve(&self, raw: &str) -> anyhow::Result<PathBuf> {
        let path = Path::new(raw);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.project_root)
                .map_err(|_| anyhow::anyhow!("'{}' is outside the project", raw))?
        } else {
            path
        };
        if !is_contained(relative) {
            anyhow::bail!("'{}' escapes the project root", raw);
        }
        Ok(self.project_root.join(relative))
    }
}

/// Relative, and never climbs above where it is joined.
pub(crate) fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl Remediation for CreatePrdStub {
    fn name(&self) -> &str {
        CREATE_PRD_STUB
    }

    async fn apply(&self, action: &Action) -> anyhow::Result<String> {
        let raw = action
            .context
            .get("path")
            .ok_or_else(|| anyhow::anyhow!("no PRD path in context"))?;
        let target = self.resolve(raw)?;

        if target.exists() {
            return Ok(format!("{} already exists", target.display()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let title = target
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Task".to_string());
        let body = format!(
            "# {title}\n\n## Goal\n\nTODO: describe the outcome.\n\n## Requirements\n\n- TODO\n\n## Acceptance Criteria\n\n- TODO\n"
        );
        tokio::fs::write(&target, body).await?;
        Ok(format!("created PRD stub at {}", target.display()))
    }
}

// ============================================================================
// Pause
// ============================================================================

/// Contents of `pause-state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseState {
    pub paused: bool,
    pub reason: String,
    pub paused_at: DateTime<Utc>,
    pub resume_at: DateTime<Utc>,
    /// Effective pause length in milliseconds.
    pub duration: u64,
}

/// Side-channel pause flag the loop polls.
#[derive(Debug, Clone)]
pub struct PauseController {
    path: PathBuf,
    max_pause: Duration,
}

impl PauseController {
    pub fn new(path: impl Into<PathBuf>, max_pause_ms: u64) -> Self {
        Self {
            path: path.into(),
            max_pause: Duration::from_millis(max_pause_ms),
        }
    }

    pub fn max_pause(&self) -> Duration {
        self.max_pause
    }

    /// Pause for `requested`, capped at the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns an error if the pause file cannot be written.
    pub fn pause(&self, reason: &str, requested: Duration) -> Result<PauseState> {
        self.pause_at(reason, requested, Utc::now())
    }

    pub fn pause_at(&self, reason: &str, requested: Duration, now: DateTime<Utc>) -> Result<PauseState> {
        let effective = requested.min(self.max_pause);
        if effective < requested {
            warn!(
                "[healer] Requested pause of {}ms capped at {}ms",
                requested.as_millis(),
                effective.as_millis()
            );
        }
        let state = PauseState {
            paused: true,
            reason: reason.to_string(),
            paused_at: now,
            resume_at: now + chrono::Duration::milliseconds(effective.as_millis() as i64),
            duration: effective.as_millis() as u64,
        };
        save_json_atomic(&self.path, &state)?;
        info!("[healer] Loop paused for {}s: {}", effective.as_secs(), reason);
        Ok(state)
    }

    /// Current pause, if one is active.
    pub fn state(&self) -> Option<PauseState> {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> Option<PauseState> {
        if !self.path.exists() {
            return None;
        }
        let state: Option<PauseState> = load_json_or_default(&self.path);
        match state {
            Some(s) if s.paused && now < s.resume_at => Some(s),
            _ => {
                self.clear();
                None
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state().is_some()
    }

    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now).is_some()
    }

    /// Time left on the active pause.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Utc::now();
        self.state_at(now)
            .and_then(|s| (s.resume_at - now).to_std().ok())
    }

    /// Clear any pause immediately.
    pub fn resume(&self) {
        if self.path.exists() {
            info!("[healer] Pause cleared");
        }
        self.clear();
    }

    fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("[healer] Could not clear pause file: {}", e);
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Decides and executes actions.
pub struct ActionDispatcher {
    analyzer: Arc<LlmAnalyzer>,
    pause: PauseController,
    events: EventBus,
    remediations: HashMap<String, Arc<dyn Remediation>>,
    recovery: Option<(Arc<RecoveryAnalyzer>, Arc<dyn TaskBackend>)>,
    history: Mutex<Vec<ActionResult>>,
    stats: Mutex<ActionStats>,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.remediations.keys().collect();
        names.sort();
        f.debug_struct("ActionDispatcher")
            .field("remediations", &names)
            .field("pause", &self.pause)
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new(analyzer: Arc<LlmAnalyzer>, pause: PauseController, events: EventBus) -> Self {
        Self {
            analyzer,
            pause,
            events,
            remediations: HashMap::new(),
            recovery: None,
            history: Mutex::new(Vec::new()),
            stats: Mutex::new(ActionStats::default()),
        }
    }

    /// Register a named remediation for `auto-fix` actions.
    #[must_use]
    pub fn with_remediation(mut self, remediation: Arc<dyn Remediation>) -> Self {
        self.remediations
            .insert(remediation.name().to_string(), remediation);
        self
    }

    /// Backend used to apply `enhance-task` actions.
    #[must_use]
    pub fn with_task_backend(mut self, recovery: Arc<RecoveryAnalyzer>, backend: Arc<dyn TaskBackend>) -> Self {
        self.recovery = Some((recovery, backend));
        self
    }

    pub fn has_remediation(&self, name: &str) -> bool {
        self.remediations.contains_key(name)
    }

    pub fn pause_controller(&self) -> &PauseController {
        &self.pause
    }

    /// Action for a classified line, or `None` for a clean exit.
    pub fn decide(m: &PatternMatch) -> Option<Action> {
        let kind = match m.kind {
            PatternKind::PrdNotFound => ActionKind::AutoFix {
                fix: CREATE_PRD_STUB.to_string(),
            },
            PatternKind::RateLimit => ActionKind::Pause {
                duration_ms: RATE_LIMIT_PAUSE_MS,
                reason: "Rate limit detected".to_string(),
            },
            PatternKind::NoPendingTasks => return None,
            PatternKind::EnvVarRequired
            | PatternKind::TaskFailed
            | PatternKind::CircuitBreaker
            | PatternKind::Timeout
            | PatternKind::FileNotFound
            | PatternKind::PermissionDenied
            | PatternKind::NetworkError
            | PatternKind::PluginError => ActionKind::Notify {
                message: notify_message(m),
                severity: m.severity,
            },
        };

        Some(Action {
            pattern: m.kind.as_str().to_string(),
            context: m.context.clone(),
            kind,
        })
    }

    /// Action for an unclassified error-like line.
    pub fn decide_unknown(line: &str) -> Action {
        Action {
            pattern: UNKNOWN_PATTERN.to_string(),
            context: BTreeMap::new(),
            kind: ActionKind::Analyze {
                error_message: line.to_string(),
            },
        }
    }

    /// Execute an action and record its outcome.
    pub async fn execute(&self, action: &Action) -> ActionResult {
        let outcome = match &action.kind {
            ActionKind::AutoFix { .. } => self.execute_auto_fix(action).await,
            ActionKind::Pause { .. } => self.execute_pause(action),
            ActionKind::Notify { .. } => self.execute_notify(action),
            ActionKind::Analyze { .. } => self.execute_analyze(action).await,
            ActionKind::EnhanceTask { .. } => self.execute_enhance(action).await,
        };

        let result = outcome.unwrap_or_else(|e| {
            error!("[healer] {} action failed: {}", action.name(), e);
            ActionResult::failed(action, e.to_string())
        });
        self.record(result.clone());
        result
    }

    /// Record an action the circuit breaker refused.
    pub fn record_blocked(&self, action: &Action) -> ActionResult {
        let result = ActionResult::blocked(action);
        self.record(result.clone());
        result
    }

    fn record(&self, result: ActionResult) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(&result);
        }
        if let Ok(mut history) = self.history.lock() {
            history.push(result);
        }
    }

    pub fn history(&self) -> Vec<ActionResult> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> ActionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Executors
    // ------------------------------------------------------------------------

    /// Run a registered remediation.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::WrongActionVariant`] for non-`auto-fix` actions.
    pub async fn execute_auto_fix(&self, action: &Action) -> Result<ActionResult> {
        let ActionKind::AutoFix { fix } = &action.kind else {
            return Err(HealerError::wrong_variant("auto-fix", action.name()));
        };

        let Some(remediation) = self.remediations.get(fix) else {
            warn!("[healer] No remediation registered for '{}'", fix);
            return Ok(ActionResult::failed(
                action,
                format!("no remediation registered for '{fix}'"),
            ));
        };

        info!("[healer] Applying fix '{}' for {}", fix, action.pattern);
        match remediation.apply(action).await {
            Ok(message) => Ok(ActionResult::ok(
                action,
                Some(json!({ "fix": fix, "message": message })),
            )),
            Err(e) => {
                warn!("[healer] Fix '{}' failed: {}", fix, e);
                Ok(ActionResult::failed(
                    action,
                    HealerError::remediation(fix.clone(), e.to_string()).to_string(),
                ))
            }
        }
    }

    /// Write the pause file.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::WrongActionVariant`] for non-`pause` actions.
    pub fn execute_pause(&self, action: &Action) -> Result<ActionResult> {
        let ActionKind::Pause { duration_ms, reason } = &action.kind else {
            return Err(HealerError::wrong_variant("pause", action.name()));
        };

        match self.pause.pause(reason, Duration::from_millis(*duration_ms)) {
            Ok(state) => Ok(ActionResult::ok(
                action,
                Some(json!({ "resumeAt": state.resume_at, "durationMs": state.duration })),
            )),
            Err(e) => Ok(ActionResult::failed(action, e.to_string())),
        }
    }

    /// Log and forward a message.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::WrongActionVariant`] for non-`notify` actions.
    pub fn execute_notify(&self, action: &Action) -> Result<ActionResult> {
        let ActionKind::Notify { message, severity } = &action.kind else {
            return Err(HealerError::wrong_variant("notify", action.name()));
        };

        match severity {
            Severity::Info => info!("[healer] {}", message),
            Severity::Warn => warn!("[healer] {}", message),
            Severity::Error | Severity::High => error!("[healer] {}", message),
        }
        self.events.publish(MonitorEvent::Notification {
            severity: *severity,
            message: message.clone(),
        });
        Ok(ActionResult::ok(action, None))
    }

    /// Run the fallback analyzer.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::WrongActionVariant`] for non-`analyze` actions.
    pub async fn execute_analyze(&self, action: &Action) -> Result<ActionResult> {
        let ActionKind::Analyze { error_message } = &action.kind else {
            return Err(HealerError::wrong_variant("analyze", action.name()));
        };

        let analysis = self.analyzer.analyze(error_message).await;
        debug!(
            "[healer] Analysis ({}, {:.2}): {}",
            analysis.source, analysis.confidence, analysis.root_cause
        );
        Ok(ActionResult::ok(
            action,
            Some(json!({
                "rootCause": analysis.root_cause,
                "suggestedFixes": analysis.suggested_fixes,
                "confidence": analysis.confidence,
                "source": analysis.source.to_string(),
                "cached": analysis.cached,
                "throttled": analysis.is_throttled(),
            })),
        ))
    }

    /// Apply a recovery analysis through the task backend.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::WrongActionVariant`] for non-`enhance-task`
    /// actions.
    pub async fn execute_enhance(&self, action: &Action) -> Result<ActionResult> {
        let ActionKind::EnhanceTask { analysis } = &action.kind else {
            return Err(HealerError::wrong_variant("enhance-task", action.name()));
        };

        let created = match &self.recovery {
            Some((recovery, backend)) => match recovery.apply(analysis, backend.as_ref()).await {
                Ok(ids) => ids,
                Err(e) => return Ok(ActionResult::failed(action, e.to_string())),
            },
            None => Vec::new(),
        };

        if !created.is_empty() {
            self.events.publish(MonitorEvent::SubTasksCreated {
                parent_id: analysis.task_id.clone(),
                ids: created.clone(),
            });
        }

        Ok(ActionResult::ok(
            action,
            Some(json!({
                "taskId": analysis.task_id,
                "exitReason": analysis.exit_reason,
                "strategy": analysis.strategy,
                "enhancement": analysis.enhancement,
                "subTasks": created,
            })),
        ))
    }
}

fn notify_message(m: &PatternMatch) -> String {
    let detail: Vec<String> = m
        .context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if detail.is_empty() {
        format!("{} detected: {}", m.kind, m.line.trim())
    } else {
        format!("{} detected ({}): {}", m.kind, detail.join(", "), m.line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::analyzer::AnalysisCache;
    use crate::config::{CacheConfig, ConcurrencyConfig, LlmConfig};
    use crate::llm::MockLlmClient;
    use crate::patterns::PatternClassifier;
    use crate::testing::MockRemediation;
    use tempfile::TempDir;

    fn dispatcher(temp: &TempDir) -> ActionDispatcher {
        let analyzer = Arc::new(LlmAnalyzer::new(
            Arc::new(MockLlmClient::new().with_response(
                r#"{"rootCause":"bad state","suggestedFixes":["reset"],"confidence":0.6}"#,
            )),
            Arc::new(AdmissionController::new(ConcurrencyConfig::default())),
            Duration::from_millis(100),
            LlmConfig::default(),
            &CacheConfig::default(),
            AnalysisCache::in_memory(60_000),
        ));
        ActionDispatcher::new(
            analyzer,
            PauseController::new(temp.path().join("pause-state.json"), 300_000),
            EventBus::default(),
        )
    }

    fn classify(line: &str) -> PatternMatch {
        PatternClassifier::new().classify(line).unwrap()
    }

    #[test]
    fn test_decide_table() {
        let prd = ActionDispatcher::decide(&classify("ERROR: PRD file not found: .specs/tasks/T-1.md")).unwrap();
        assert_eq!(prd.kind, ActionKind::AutoFix { fix: CREATE_PRD_STUB.into() });

        let rate = ActionDispatcher::decide(&classify("Error: Rate limit exceeded (429 Too Many Requests)")).unwrap();
        assert!(matches!(rate.kind, ActionKind::Pause { duration_ms: 60_000, .. }));

        assert!(ActionDispatcher::decide(&classify("No pending tasks remaining")).is_none());

        let env = ActionDispatcher::decide(&classify("Error: CLAUDE_API_KEY is required")).unwrap();
        match env.kind {
            ActionKind::Notify { message, severity } => {
                assert_eq!(severity, Severity::Error);
                assert!(message.contains("envVar=CLAUDE_API_KEY"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let unknown = ActionDispatcher::decide_unknown("Segfault in worker");
        assert_eq!(unknown.name(), "analyze");
        assert_eq!(unknown.pattern, UNKNOWN_PATTERN);
    }

    #[tokio::test]
    async fn test_wrong_variant_is_contract_violation() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp);
        let notify = ActionDispatcher::decide(&classify("Error: CLAUDE_API_KEY is required")).unwrap();

        let err = d.execute_pause(&notify).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(d.execute_auto_fix(&notify).await.is_err());
        assert!(d.execute_analyze(&notify).await.is_err());
        assert!(d.execute_enhance(&notify).await.is_err());
        let pause = ActionDispatcher::decide(&classify("429 Too Many Requests")).unwrap();
        assert!(d.execute_notify(&pause).is_err());
    }

    #[tokio::test]
    async fn test_pause_is_capped_and_persisted() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp);
        let action = Action {
            pattern: "manual".into(),
            context: BTreeMap::new(),
            kind: ActionKind::Pause {
                duration_ms: 3_600_000,
                reason: "long".into(),
            },
        };

        let result = d.execute(&action).await;
        assert!(result.success);
        let state = d.pause_controller().state().unwrap();
        assert_eq!(state.duration, 300_000);
        assert!(d.pause_controller().is_paused());

        d.pause_controller().resume();
        assert!(!d.pause_controller().is_paused());
    }

    #[test]
    fn test_pause_expires() {
        let temp = TempDir::new().unwrap();
        let pause = PauseController::new(temp.path().join("pause.json"), 300_000);
        let now = Utc::now();
        pause.pause_at("rate limit", Duration::from_secs(60), now).unwrap();

        assert!(pause.is_paused_at(now + chrono::Duration::seconds(59)));
        assert!(!pause.is_paused_at(now + chrono::Duration::seconds(60)));
        assert!(!temp.path().join("pause.json").exists());
    }

    #[tokio::test]
    async fn test_auto_fix_uses_registered_remediation() {
        let temp = TempDir::new().unwrap();
        let fix = Arc::new(MockRemediation::new("restart-worker"));
        let d = dispatcher(&temp).with_remediation(fix.clone());
        let action = Action {
            pattern: "task-failed".into(),
            context: BTreeMap::new(),
            kind: ActionKind::AutoFix {
                fix: "restart-worker".into(),
            },
        };

        assert!(d.execute(&action).await.success);
        assert_eq!(fix.call_count(), 1);

        let missing = Action {
            kind: ActionKind::AutoFix { fix: "nope".into() },
            ..action
        };
        let result = d.execute(&missing).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_create_prd_stub_writes_skeleton() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp).with_remediation(Arc::new(CreatePrdStub::new(temp.path())));
        let action = ActionDispatcher::decide(&classify(
            "ERROR: PRD file not found: .specs/tasks/TASK-001.md",
        ))
        .unwrap();

        let result = d.execute(&action).await;
        assert!(result.success, "{:?}", result.error);
        let written = std::fs::read_to_string(temp.path().join(".specs/tasks/TASK-001.md")).unwrap();
        assert!(written.starts_with("# TASK-001"));
    }

    #[tokio::test]
    async fn test_create_prd_stub_refuses_escape() {
        let temp = TempDir::new().unwrap();
        let stub = CreatePrdStub::new(temp.path());
        let mut context = BTreeMap::new();
        context.insert("path".to_string(), "../outside.md".to_string());
        let action = Action {
            pattern: "prd-not-found".into(),
            context,
            kind: ActionKind::AutoFix {
                fix: CREATE_PRD_STUB.into(),
            },
        };
        assert!(stub.apply(&action).await.is_err());
    }

    #[tokio::test]
    async fn test_analyze_reports_details() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp);
        let result = d.execute(&ActionDispatcher::decide_unknown("worker exploded")).await;
        assert!(result.success);
        let details = result.details.unwrap();
        assert_eq!(details["rootCause"], "bad state");
        assert_eq!(details["throttled"], false);

        let second = d.execute(&ActionDispatcher::decide_unknown("scheduler exploded")).await;
        assert!(second.success);
        assert!(second.is_throttled());
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp);
        let notify = ActionDispatcher::decide(&classify("Error: CLAUDE_API_KEY is required")).unwrap();
        d.execute(&notify).await;
        d.record_blocked(&notify);
        d.execute(&ActionDispatcher::decide_unknown("Segfault")).await;

        let stats = d.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.by_type["notify"], 2);
        assert_eq!(stats.by_pattern["env-var-required"], 2);
        assert_eq!(d.history().len(), 3);
        assert!(d.history()[1].blocked);
    }

    #[tokio::test]
    async fn test_notify_publishes_event() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(&temp);
        let mut rx = d.events.subscribe();
        let notify = ActionDispatcher::decide(&classify("Error: CLAUDE_API_KEY is required")).unwrap();
        d.execute(&notify).await;
        assert!(matches!(rx.recv().await.unwrap(), MonitorEvent::Notification { .. }));
    }
}
