//! Integration tests for the ralph-healer CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

/// Get a Command for the ralph-healer binary
fn healer() -> Command {
    Command::new(cargo::cargo_bin!("ralph-healer"))
}

fn state_dir(temp: &TempDir) -> std::path::PathBuf {
    let dir = temp.path().join(".ralph").join("healer");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_help() {
    healer()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Self-healing supervisor"));
}

#[test]
fn test_version() {
    healer()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

// ============================================================
// classify / hash
// ============================================================

#[test]
fn test_classify_prd_not_found() {
    healer()
        .args(["classify", "ERROR: PRD file not found: .specs/tasks/TASK-001.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prd-not-found"))
        .stdout(predicate::str::contains("TASK-001.md"));
}

#[test]
fn test_classify_json() {
    let output = healer()
        .args(["classify", "--json", "Error: CLAUDE_API_KEY is required"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["kind"], "env-var-required");
    assert_eq!(value["severity"], "ERROR");
    assert_eq!(value["context"]["envVar"], "CLAUDE_API_KEY");
}

#[test]
fn test_classify_no_match() {
    healer()
        .args(["classify", "INFO: Task completed successfully"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no match"));
}

#[test]
fn test_hash_ignores_timestamps_and_paths() {
    let hash = |message: &str| {
        let output = healer().args(["hash", message]).output().unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap()
    };

    let a = hash("Build failed at 2024-01-01 10:00:00 in /home/a/project/src/main.rs");
    let b = hash("Build failed at 2025-06-30 23:59:59 in /srv/ci/project/src/main.rs");
    assert_eq!(a, b);
    assert_eq!(a.trim().len(), 64);
}

// ============================================================
// verify
// ============================================================

#[test]
fn test_verify_skips_undiscoverable_commands() {
    let temp = TempDir::new().unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .args(["verify", "--checks", "build,test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASSED"));
}

#[test]
fn test_verify_error_free_fails_on_errors() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("loop.log");
    std::fs::write(&log, "starting\nERROR: database connection lost\n").unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .args(["verify", "--checks", "error_free", "--log"])
        .arg(&log)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED"));
}

#[test]
fn test_verify_unknown_check_is_rejected() {
    let temp = TempDir::new().unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .args(["verify", "--checks", "vibes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown check"));
}

// ============================================================
// status / resume / cache-prune
// ============================================================

#[test]
fn test_status_on_fresh_project() {
    let temp = TempDir::new().unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no session recorded"))
        .stdout(predicate::str::contains("not paused"));
}

#[test]
fn test_resume_clears_active_pause() {
    let temp = TempDir::new().unwrap();
    let pause_file = state_dir(&temp).join("pause-state.json");
    let now = chrono::Utc::now();
    let state = json!({
        "paused": true,
        "reason": "Rate limit detected",
        "pausedAt": now.to_rfc3339(),
        "resumeAt": (now + chrono::Duration::minutes(2)).to_rfc3339(),
        "duration": 120000
    });
    std::fs::write(&pause_file, serde_json::to_string_pretty(&state).unwrap()).unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Rate limit detected"));

    healer()
        .arg("--project")
        .arg(temp.path())
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pause cleared"));

    assert!(!pause_file.exists());
}

#[test]
fn test_cache_prune_removes_expired_entries() {
    let temp = TempDir::new().unwrap();
    let cache_file = state_dir(&temp).join("llm-cache.json");
    let cache = json!({
        "old": {
            "errorHash": "old",
            "analysis": {"rootCause": "stale", "suggestedFixes": [], "confidence": 0.5},
            "cachedAt": "2020-01-01T00:00:00Z",
            "expiresAt": "2020-01-02T00:00:00Z"
        },
        "fresh": {
            "errorHash": "fresh",
            "analysis": {"rootCause": "recent", "suggestedFixes": [], "confidence": 0.5},
            "cachedAt": "2099-01-01T00:00:00Z",
            "expiresAt": "2099-01-02T00:00:00Z"
        }
    });
    std::fs::write(&cache_file, serde_json::to_string_pretty(&cache).unwrap()).unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .arg("cache-prune")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 expired cache entries (1 left)"));

    let remaining = std::fs::read_to_string(&cache_file).unwrap();
    assert!(remaining.contains("fresh"));
    assert!(!remaining.contains("stale"));
}

#[test]
fn test_invalid_config_exits_with_config_code() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".ralph")).unwrap();
    std::fs::write(
        temp.path().join(".ralph").join("healer.json"),
        r#"{"circuitBreaker": {"maxFailures": 0}}"#,
    )
    .unwrap();

    healer()
        .arg("--project")
        .arg(temp.path())
        .arg("status")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("circuitBreaker.maxFailures"));
}
