//! Monitor orchestrator.
//!
//! Owns the session state and wires the pieces together:
//!
//! ```text
//! tailer ─▶ classifier ─▶ dispatcher ─▶ circuit breaker gate ─▶ execute
//!                │                                                 │
//!                └─ unknown ─▶ seen-set ─▶ throttle ─▶ analyze      ├─▶ wisdom
//!                                                                  └─▶ verify (auto-fix)
//! ```
//!
//! Task lifecycle hooks feed the recovery analyzer, deduplicated per
//! `(task, exit reason)`. A health timer flags stale sessions and runs
//! periodic maintenance; a lifetime timer stops the monitor after the
//! configured maximum session length.
//!
//! All mutable state sits behind one mutex per concern and is never held
//! across an await point.
//!
//! # Modules
//!
//! - [`state`] - Persisted `monitor-state.json`

pub mod state;

pub use state::{MonitorState, RecoveryRecord};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{
    Action, ActionDispatcher, ActionKind, ActionResult, ActionStats, CreatePrdStub, PauseController,
    Remediation,
};
use crate::admission::AdmissionController;
use crate::analyzer::{normalize_error, AnalysisCache, LlmAnalyzer};
use crate::circuit::CircuitState;
use crate::config::{HealerConfig, StatePaths};
use crate::error::Result;
use crate::events::{EventBus, MonitorEvent};
use crate::llm::LlmClient;
use crate::patterns::PatternClassifier;
use crate::recovery::{RecoveryAnalysis, RecoveryAnalyzer, TaskBackend};
use crate::tailer::{LogTailer, TailEvent, TailerConfig};
use crate::verify::VerificationEngine;
use crate::wisdom::{pattern_signature, WisdomStore};

/// Log lines kept for recovery evidence.
const RECENT_LINES: usize = 200;

/// Minimum spacing of wisdom/cache maintenance on the health timer.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// The task a lifecycle hook refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    pub title: String,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            title: task_id.clone(),
            task_id,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Point-in-time health summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub session_id: String,
    pub uptime_ms: u64,
    pub idle_ms: u64,
    pub stale: bool,
    pub circuit_state: CircuitState,
    pub llm_calls: u32,
    pub actions: ActionStats,
}

/// Self-healing monitor for one session.
pub struct Monitor {
    config: HealerConfig,
    paths: StatePaths,
    classifier: PatternClassifier,
    analyzer: Arc<LlmAnalyzer>,
    dispatcher: ActionDispatcher,
    verifier: VerificationEngine,
    recovery: Arc<RecoveryAnalyzer>,
    backend: Option<Arc<dyn TaskBackend>>,
    wisdom: Mutex<WisdomStore>,
    state: Mutex<MonitorState>,
    recent: Mutex<VecDeque<String>>,
    events: EventBus,
    stale_flagged: AtomicBool,
    last_maintenance: Mutex<DateTime<Utc>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("paths", &self.paths)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Monitor {
    /// Build a monitor for `project_root`, loading persisted state from
    /// `paths`.
    pub fn new(
        project_root: impl Into<PathBuf>,
        paths: StatePaths,
        config: HealerConfig,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        let project_root = project_root.into();
        let now = Utc::now();

        let admission = Arc::new(AdmissionController::new(config.concurrency.clone()));
        let cache = AnalysisCache::load(&paths.cache_file, config.cache.ttl_ms);
        let analyzer = Arc::new(LlmAnalyzer::new(
            client,
            admission,
            Duration::from_millis(config.concurrency.acquire_timeout_ms),
            config.llm.clone(),
            &config.cache,
            cache,
        ));

        let state = MonitorState::resume_or_start(&paths.monitor_state_file, &config, now);
        analyzer.restore_throttle(state.throttle());

        let mut wisdom = WisdomStore::load(&paths.wisdom_file, config.wisdom.clone());
        wisdom.start_session();

        let events = EventBus::default();
        let pause = PauseController::new(&paths.pause_file, config.pause.max_pause_ms);
        let dispatcher = ActionDispatcher::new(analyzer.clone(), pause, events.clone())
            .with_remediation(Arc::new(CreatePrdStub::new(&project_root)));

        let (shutdown, _) = watch::channel(false);

        Self {
            verifier: VerificationEngine::new(&project_root, config.verification.clone()),
            recovery: Arc::new(RecoveryAnalyzer::new(&project_root)),
            classifier: PatternClassifier::new(),
            backend: None,
            wisdom: Mutex::new(wisdom),
            state: Mutex::new(state),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_LINES)),
            stale_flagged: AtomicBool::new(false),
            last_maintenance: Mutex::new(now),
            config,
            paths,
            analyzer,
            dispatcher,
            events,
            shutdown,
        }
    }

    /// Register an extra remediation for `auto-fix` actions and wisdom
    /// upgrades.
    #[must_use]
    pub fn with_remediation(mut self, remediation: Arc<dyn Remediation>) -> Self {
        self.dispatcher = self.dispatcher.with_remediation(remediation);
        self
    }

    /// Enable task recovery against the loop's task store.
    #[must_use]
    pub fn with_task_backend(mut self, backend: Arc<dyn TaskBackend>) -> Self {
        self.dispatcher = self
            .dispatcher
            .with_task_backend(self.recovery.clone(), backend.clone());
        self.backend = Some(backend);
        self
    }

    /// Log the ERROR_FREE verification check scans.
    #[must_use]
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.verifier = self.verifier.with_log(path);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Snapshot of the session state.
    pub fn state(&self) -> MonitorState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> Option<R> {
        match self.state.lock() {
            Ok(mut state) => Some(f(&mut state)),
            Err(_) => {
                warn!("[healer] Monitor state lock poisoned");
                None
            }
        }
    }

    fn persist(&self) {
        let throttle = self.analyzer.throttle_snapshot();
        let snapshot = self.with_state(|s| {
            s.set_throttle(throttle);
            s.clone()
        });
        if let Some(state) = snapshot {
            if let Err(e) = state.save(&self.paths.monitor_state_file) {
                warn!("[healer] Failed to save monitor state: {}", e);
            }
        }
    }

    fn remember_line(&self, line: &str) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_LINES {
                recent.pop_front();
            }
            recent.push_back(line.to_string());
        }
    }

    // ------------------------------------------------------------------------
    // Line handling
    // ------------------------------------------------------------------------

    /// Process one log line. Returns the result of any action taken.
    pub async fn handle_line(&self, line: &str) -> Option<ActionResult> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return None;
        }

        self.with_state(|s| s.touch(Utc::now()));
        self.stale_flagged.store(false, Ordering::SeqCst);
        self.remember_line(line);

        let result = match self.classifier.classify(line) {
            Some(m) => {
                self.with_state(|s| s.record_pattern(m.kind.as_str()));
                debug!("[healer] {} [{}]: {}", m.kind, m.severity, line);
                self.events.publish(MonitorEvent::LineClassified {
                    pattern: m.kind.as_str().to_string(),
                    severity: m.severity,
                    line: line.to_string(),
                });

                match ActionDispatcher::decide(&m) {
                    None => {
                        info!("[healer] Clean exit detected");
                        self.events.publish(MonitorEvent::CleanExit {
                            line: line.to_string(),
                        });
                        None
                    }
                    Some(action) => {
                        let signature = pattern_signature(
                            m.kind.as_str(),
                            self.classifier.regex_source(m.kind),
                            &m.severity.to_string(),
                        );
                        let action = self.apply_wisdom(action, &signature);
                        Some(self.run_gated(action, Some(signature)).await)
                    }
                }
            }
            None if self.classifier.is_unknown_error_candidate(line) => {
                self.handle_unknown(line).await
            }
            None => None,
        };

        self.persist();
        result
    }

    /// Upgrade a `notify` to a trusted, registered fix.
    fn apply_wisdom(&self, action: Action, signature: &str) -> Action {
        if !matches!(action.kind, ActionKind::Notify { .. }) {
            return action;
        }
        let trusted = self
            .wisdom
            .lock()
            .ok()
            .and_then(|w| w.find_trusted(signature));
        match trusted {
            Some(pattern) if self.dispatcher.has_remediation(&pattern.fix_action) => {
                info!(
                    "[healer] Using trusted fix '{}' for {} ({} past successes)",
                    pattern.fix_action, action.pattern, pattern.success_count
                );
                Action {
                    kind: ActionKind::AutoFix {
                        fix: pattern.fix_action,
                    },
                    ..action
                }
            }
            _ => action,
        }
    }

    async fn handle_unknown(&self, line: &str) -> Option<ActionResult> {
        self.events.publish(MonitorEvent::UnknownError {
            line: line.to_string(),
        });

        let normalized = self
            .config
            .monitoring
            .cache_unknown_errors
            .then(|| normalize_error(line));
        if let Some(normalized) = &normalized {
            if self.with_state(|s| s.is_unknown_seen(normalized)) != Some(false) {
                debug!("[healer] Unknown error already analyzed this session");
                return None;
            }
        }

        if let Some(reason) = self.analyzer.check_throttle().reason() {
            debug!("[healer] Unknown error not analyzed: {}", reason);
            return None;
        }

        // Only an error that is actually analyzed counts as seen.
        if let Some(normalized) = &normalized {
            if self.with_state(|s| s.mark_unknown_seen(normalized)) != Some(true) {
                return None;
            }
        }

        Some(
            self.run_gated(ActionDispatcher::decide_unknown(line), None)
                .await,
        )
    }

    /// Execute behind the circuit breaker and feed the outcome back.
    async fn run_gated(&self, action: Action, signature: Option<String>) -> ActionResult {
        let permitted = self
            .with_state(|s| s.circuit_breaker.can_proceed())
            .unwrap_or(false);
        if !permitted {
            let circuit = self
                .with_state(|s| s.circuit_breaker.state())
                .unwrap_or(CircuitState::Open);
            warn!(
                "[healer] Circuit breaker {}: skipping {} for {}",
                circuit,
                action.name(),
                action.pattern
            );
            self.events.publish(MonitorEvent::ActionBlocked {
                action: action.name().to_string(),
                pattern: action.pattern.clone(),
                circuit,
            });
            return self.dispatcher.record_blocked(&action);
        }

        // The triggering line is already in the log; only later output
        // tells whether the fix held.
        let log_mark = self.verifier.log_len();
        let result = self.dispatcher.execute(&action).await;
        let mut healed = result.success;

        if let ActionKind::AutoFix { fix } = &action.kind {
            if result.success && self.config.monitoring.verify_after_fix {
                healed = self.verify_fix(fix, &action.pattern, log_mark).await;
            }
        }

        if !result.is_throttled() {
            self.with_state(|s| {
                if healed {
                    s.circuit_breaker.record_success();
                } else {
                    s.circuit_breaker.record_failure();
                    if s.circuit_breaker.state() == CircuitState::Open {
                        warn!(
                            "[healer] Circuit breaker opened after {} consecutive failures",
                            s.circuit_breaker.consecutive_failures()
                        );
                    }
                }
            });
        }

        if let (Some(signature), Some(fix)) = (signature, learned_fix_name(&action)) {
            if let Ok(mut wisdom) = self.wisdom.lock() {
                if healed {
                    let tags: Vec<String> = action.context.keys().cloned().collect();
                    wisdom.record_success(&signature, fix, &tags);
                } else {
                    wisdom.record_failure(&signature, fix);
                }
            }
        }

        self.events.publish(MonitorEvent::ActionExecuted {
            result: result.clone(),
        });
        result
    }

    async fn verify_fix(&self, fix: &str, pattern: &str, log_mark: u64) -> bool {
        let claim = format!("auto-fix '{fix}' resolved {pattern}");
        let verification = self.verifier.verify_since(&claim, Some(log_mark)).await;
        if verification.passed {
            info!("[healer] Verified: {}", verification.summary());
        } else {
            warn!(
                "[healer] Fix '{}' did not verify: {}",
                fix,
                verification.summary()
            );
        }
        self.events.publish(MonitorEvent::VerificationCompleted {
            claim: verification.claim.clone(),
            passed: verification.passed,
            failed_checks: verification.failed_checks.clone(),
        });
        verification.passed
    }

    // ------------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------------

    pub fn on_loop_start(&self) {
        let session = self.with_state(|s| {
            s.touch(Utc::now());
            s.session_id.clone()
        });
        info!(
            "[healer] Monitoring loop (session {})",
            session.unwrap_or_default()
        );
        self.persist();
    }

    /// Stop the timers and flush state.
    pub fn on_loop_end(&self) {
        self.stop("loop ended");
    }

    pub fn on_task_start(&self, task: &TaskContext) {
        debug!("[healer] Task started: {} ({})", task.task_id, task.title);
        self.with_state(|s| s.touch(Utc::now()));
    }

    pub fn on_task_complete(&self, task: &TaskContext) {
        let settled = self
            .with_state(|s| {
                s.touch(Utc::now());
                s.resolve_recoveries(&task.task_id, true)
            })
            .unwrap_or(0);
        if settled > 0 {
            info!("[healer] Recovery of {} succeeded", task.task_id);
            self.persist();
        }
    }

    /// Diagnose an early exit and enhance the task, at most once per
    /// `(task, exit reason)`.
    pub async fn on_task_failed(&self, task: &TaskContext, error: &str) -> Option<RecoveryAnalysis> {
        let repeat = self
            .with_state(|s| {
                s.touch(Utc::now());
                s.resolve_recoveries(&task.task_id, false)
            })
            .unwrap_or(0);
        if repeat > 0 {
            warn!("[healer] {} failed again after recovery", task.task_id);
        }

        let Some(backend) = self.backend.clone() else {
            debug!("[healer] No task backend, skipping recovery for {}", task.task_id);
            return None;
        };

        let mut evidence: Vec<String> = self
            .recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        if !error.trim().is_empty() {
            evidence.push(error.to_string());
        }

        let analysis = self
            .recovery
            .analyze_early_exit(&task.task_id, &evidence, backend.as_ref())
            .await;
        let key = analysis.history_key();

        if self.with_state(|s| s.has_recovery(&key)).unwrap_or(true) {
            info!("[healer] Recovery for {} already attempted, skipping", key);
            self.events.publish(MonitorEvent::RecoverySkipped {
                task_id: analysis.task_id.clone(),
                exit_reason: analysis.exit_reason,
                reason: "already attempted this session".to_string(),
            });
            self.persist();
            return None;
        }

        let open = self
            .with_state(|s| s.circuit_breaker.can_proceed())
            .unwrap_or(false);
        if !open {
            self.events.publish(MonitorEvent::RecoverySkipped {
                task_id: analysis.task_id.clone(),
                exit_reason: analysis.exit_reason,
                reason: "circuit breaker open".to_string(),
            });
            return None;
        }

        self.with_state(|s| s.start_recovery(&key, Utc::now()));
        info!(
            "[healer] {} exited early ({}), applying {}",
            analysis.task_id, analysis.exit_reason, analysis.strategy
        );
        self.events.publish(MonitorEvent::RecoveryPlanned {
            task_id: analysis.task_id.clone(),
            exit_reason: analysis.exit_reason,
            strategy: analysis.strategy,
        });

        let mut context = std::collections::BTreeMap::new();
        context.insert("taskId".to_string(), analysis.task_id.clone());
        context.insert("exitReason".to_string(), analysis.exit_reason.to_string());
        let action = Action {
            pattern: "task-failed".to_string(),
            context,
            kind: ActionKind::EnhanceTask {
                analysis: Box::new(analysis.clone()),
            },
        };
        self.run_gated(action, None).await;
        self.persist();

        Some(analysis)
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    pub fn health(&self) -> HealthReport {
        self.health_at(Utc::now())
    }

    pub fn health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let state = self.state();
        let idle = state.idle_at(now);
        HealthReport {
            session_id: state.session_id.clone(),
            uptime_ms: (now - state.start_time).num_milliseconds().max(0) as u64,
            idle_ms: idle.num_milliseconds().max(0) as u64,
            stale: idle.num_milliseconds() >= self.config.health.stale_detection_ms as i64,
            circuit_state: state.circuit_breaker.state(),
            llm_calls: self.analyzer.throttle_snapshot().call_count,
            actions: self.dispatcher.stats(),
        }
    }

    /// Health timer body: stale detection and periodic maintenance.
    pub fn check_health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let report = self.health_at(now);

        if report.stale && !self.stale_flagged.swap(true, Ordering::SeqCst) {
            warn!(
                "[healer] No activity for {}s, session looks stale",
                report.idle_ms / 1000
            );
            self.events.publish(MonitorEvent::StaleSession {
                idle_ms: report.idle_ms,
            });
        }

        let due = self
            .last_maintenance
            .lock()
            .map(|mut last| {
                let due = (now - *last).to_std().unwrap_or_default() >= MAINTENANCE_INTERVAL;
                if due {
                    *last = now;
                }
                due
            })
            .unwrap_or(false);
        if due {
            self.maintain();
        }

        report
    }

    fn maintain(&self) {
        let purged = self
            .wisdom
            .lock()
            .map(|mut w| w.purge_expired())
            .unwrap_or(0);
        let cleaned = self.analyzer.cleanup_cache();
        if purged + cleaned > 0 {
            debug!(
                "[healer] Maintenance: {} wisdom patterns, {} cache entries expired",
                purged, cleaned
            );
        }
        self.persist();
    }

    // ------------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------------

    /// Request shutdown of a running [`Monitor::watch`] loop.
    pub fn stop(&self, reason: &str) {
        debug!("[healer] Stop requested: {}", reason);
        self.shutdown.send_replace(true);
    }

    /// Tail `log_path` and heal until stopped or the lifetime expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the tailer cannot be started.
    pub fn watch(self: Arc<Self>, log_path: &Path) -> Result<MonitorHandle> {
        let tailer = LogTailer::new(log_path, TailerConfig::from(&self.config.monitoring));
        let (tail_handle, mut lines) = tailer.start()?;
        let mut shutdown = self.shutdown.subscribe();
        self.shutdown.send_replace(false);
        self.on_loop_start();

        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let health_every =
                Duration::from_millis(monitor.config.health.health_check_interval_ms.max(1));
            let mut health = tokio::time::interval(health_every);
            health.tick().await;
            let lifetime = tokio::time::sleep(Duration::from_millis(
                monitor.config.health.max_lifetime_ms,
            ));
            tokio::pin!(lifetime);

            let reason = loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break "stopped".to_string();
                        }
                    }
                    event = lines.recv() => match event {
                        Some(TailEvent::Line(line)) => {
                            monitor.handle_line(&line.text).await;
                        }
                        Some(TailEvent::Truncated { previous_size, current_size }) => {
                            info!(
                                "[healer] Log truncated ({} -> {} bytes), reading from start",
                                previous_size, current_size
                            );
                        }
                        Some(TailEvent::Error { message }) => {
                            monitor.events.publish(MonitorEvent::TailerError { message });
                        }
                        None => break "tailer closed".to_string(),
                    },
                    _ = health.tick() => {
                        monitor.check_health_at(Utc::now());
                    }
                    () = &mut lifetime => {
                        let uptime_ms = monitor.health().uptime_ms;
                        warn!(
                            "[healer] Maximum session lifetime reached after {}s, stopping",
                            uptime_ms / 1000
                        );
                        monitor.events.publish(MonitorEvent::LifetimeExceeded { uptime_ms });
                        break "lifetime exceeded".to_string();
                    }
                }
            };

            tail_handle.stop();
            monitor.persist();
            info!("[healer] Monitor stopped: {}", reason);
            monitor.events.publish(MonitorEvent::Stopped {
                reason: reason.clone(),
            });
            reason
        });

        Ok(MonitorHandle {
            monitor: self,
            task: Some(task),
        })
    }
}

/// Wisdom key for a fix action; only fixes and pauses are learned.
fn learned_fix_name(action: &Action) -> Option<&str> {
    match &action.kind {
        ActionKind::AutoFix { fix } => Some(fix),
        ActionKind::Pause { .. } => Some("pause"),
        ActionKind::Notify { .. } | ActionKind::Analyze { .. } | ActionKind::EnhanceTask { .. } => {
            None
        }
    }
}

/// Running [`Monitor::watch`] loop.
pub struct MonitorHandle {
    monitor: Arc<Monitor>,
    task: Option<JoinHandle<String>>,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl MonitorHandle {
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn stop(&self) {
        self.monitor.stop("stop requested");
    }

    /// Wait for the loop to finish. Returns the stop reason.
    pub async fn wait(mut self) -> String {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| format!("monitor task failed: {e}")),
            None => "not running".to_string(),
        }
    }

    /// Stop and wait.
    pub async fn shutdown(self) -> String {
        self.stop();
        self.wait().await
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.monitor.stop("handle dropped");
        }
    }
}
