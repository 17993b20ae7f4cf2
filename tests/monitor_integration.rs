//! End-to-end tests for the tailer and the monitor loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ralph_healer::config::MonitoringConfig;
use ralph_healer::testing::MockTaskBackend;
use ralph_healer::verify::{CheckSpec, CheckType};
use ralph_healer::{
    HealerConfig, LogTailer, MockLlmClient, Monitor, MonitorEvent, StatePaths, TailEvent,
    TailerConfig, TaskContext,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

fn fast_tailer() -> TailerConfig {
    TailerConfig::from(&MonitoringConfig {
        polling_interval_ms: 50,
        debounce_ms: 20,
        ..MonitoringConfig::default()
    })
}

async fn next_line(rx: &mut mpsc::Receiver<TailEvent>) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(TailEvent::Line(line))) => return Some(line.text),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

async fn next_event<F>(rx: &mut broadcast::Receiver<MonitorEvent>, pred: F) -> Option<MonitorEvent>
where
    F: Fn(&MonitorEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

fn test_config() -> HealerConfig {
    let mut config = HealerConfig::default();
    config.monitoring.polling_interval_ms = 50;
    config.monitoring.debounce_ms = 20;
    config.verification.checks = vec![CheckSpec::optional(CheckType::Functionality)];
    config
}

// ============================================================
// Tailer
// ============================================================

#[tokio::test]
async fn test_tailer_emits_only_new_lines_once() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "old line 1\nold line 2\n").unwrap();

    let (handle, mut rx) = LogTailer::new(&log, fast_tailer()).start().unwrap();

    append(&log, "new line 1\nnew line 2\n");
    assert_eq!(next_line(&mut rx).await.as_deref(), Some("new line 1"));
    assert_eq!(next_line(&mut rx).await.as_deref(), Some("new line 2"));

    // Let both the watch and the poll fire; nothing else may arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, TailEvent::Line(_)), "duplicate: {:?}", event);
    }

    handle.stop();
    assert!(handle.is_stopped());
}

#[tokio::test]
async fn test_tailer_joins_partial_lines() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "").unwrap();

    let (handle, mut rx) = LogTailer::new(&log, fast_tailer()).start().unwrap();

    append(&log, "half of a ");
    tokio::time::sleep(Duration::from_millis(200)).await;
    append(&log, "line\n");
    assert_eq!(next_line(&mut rx).await.as_deref(), Some("half of a line"));

    handle.stop();
}

#[tokio::test]
async fn test_tailer_restarts_after_truncation() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "a fairly long line that will be truncated away\n").unwrap();

    let (handle, mut rx) = LogTailer::new(&log, fast_tailer()).start().unwrap();

    std::fs::write(&log, "fresh\n").unwrap();
    assert_eq!(next_line(&mut rx).await.as_deref(), Some("fresh"));

    handle.stop();
}

// ============================================================
// Monitor loop
// ============================================================

#[tokio::test]
async fn test_monitor_heals_lines_from_log() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "ERROR: PRD file not found: .specs/tasks/OLD.md\n").unwrap();

    let monitor = Arc::new(Monitor::new(
        temp.path(),
        StatePaths::for_project(temp.path()),
        test_config(),
        Arc::new(MockLlmClient::new()),
    ));
    let mut events = monitor.subscribe();
    let handle = monitor.clone().watch(&log).unwrap();

    append(&log, "ERROR: PRD file not found: .specs/tasks/TASK-042.md\n");

    let executed = next_event(&mut events, |e| matches!(e, MonitorEvent::ActionExecuted { .. }))
        .await
        .expect("action executed");
    match executed {
        MonitorEvent::ActionExecuted { result } => {
            assert_eq!(result.action, "auto-fix");
            assert!(result.success, "{:?}", result.error);
        }
        other => panic!("unexpected {:?}", other),
    }

    assert!(temp.path().join(".specs/tasks/TASK-042.md").exists());
    assert!(!temp.path().join(".specs/tasks/OLD.md").exists());

    assert_eq!(handle.shutdown().await, "stopped");
    let state = monitor.state();
    assert_eq!(state.detected_patterns["prd-not-found"], 1);
    assert!(temp.path().join(".ralph/healer/monitor-state.json").exists());
}

#[tokio::test]
async fn test_monitor_stops_at_max_lifetime() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "").unwrap();

    let mut config = test_config();
    config.health.max_lifetime_ms = 200;
    config.health.health_check_interval_ms = 50;

    let monitor = Arc::new(Monitor::new(
        temp.path(),
        StatePaths::for_project(temp.path()),
        config,
        Arc::new(MockLlmClient::new()),
    ));
    let mut events = monitor.subscribe();
    let handle = monitor.clone().watch(&log).unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("monitor stopped on its own");
    assert_eq!(reason, "lifetime exceeded");
    assert!(next_event(&mut events, |e| matches!(e, MonitorEvent::LifetimeExceeded { .. }))
        .await
        .is_some());
}

#[tokio::test]
async fn test_monitor_recovery_splits_large_task() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MockTaskBackend::new());
    let monitor = Monitor::new(
        temp.path(),
        StatePaths::for_project(temp.path()),
        test_config(),
        Arc::new(MockLlmClient::new()),
    )
    .with_task_backend(backend.clone());
    let mut events = monitor.subscribe();

    monitor
        .handle_line("This is too complex and touches too many files. Should we split it?")
        .await;
    let analysis = monitor
        .on_task_failed(&TaskContext::new("T-12"), "agent exited early")
        .await
        .expect("recovery planned");

    assert!(next_event(&mut events, |e| matches!(e, MonitorEvent::SubTasksCreated { .. }))
        .await
        .is_some());
    assert_eq!(analysis.history_key(), "T-12:scope_large");
    assert!(backend.created_sub_tasks().len() >= 2);
    assert!(backend
        .created_sub_tasks()
        .iter()
        .all(|(parent, _)| parent == "T-12"));

    // Same failure again: no second enhancement.
    assert!(monitor
        .on_task_failed(&TaskContext::new("T-12"), "agent exited early")
        .await
        .is_none());
}
