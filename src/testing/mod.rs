//! Test doubles for the healer's external seams.
//!
//! The task loop and fix implementations live outside this crate. These
//! mocks stand in for them with controllable, recorded behavior.
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_healer::testing::{MockRemediation, MockTaskBackend};
//!
//! let backend = MockTaskBackend::new().with_error("backend offline");
//! let fix = MockRemediation::new("restart-worker").with_fail_count(1);
//! ```

pub mod mocks;

pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionKind, Remediation};
    use crate::recovery::{SubTaskData, TaskBackend, TaskInfo};
    use std::collections::BTreeMap;

    fn action() -> Action {
        Action {
            pattern: "task-failed".into(),
            context: BTreeMap::new(),
            kind: ActionKind::AutoFix {
                fix: "restart".into(),
            },
        }
    }

    // =========================================================================
    // Mock Task Backend Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_backend_unknown_task() {
        let backend = MockTaskBackend::new();
        assert!(backend.get_task("T-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_backend_with_task() {
        let backend = MockTaskBackend::new().with_task(TaskInfo {
            id: "T-1".into(),
            title: "Billing".into(),
            ..TaskInfo::default()
        });
        let task = backend.get_task("T-1").await.unwrap().unwrap();
        assert_eq!(task.title, "Billing");
    }

    #[tokio::test]
    async fn test_mock_backend_records_sub_tasks() {
        let backend = MockTaskBackend::new();
        let a = backend
            .create_sub_task("T-1", SubTaskData { title: "a".into(), ..SubTaskData::default() })
            .await
            .unwrap();
        let b = backend
            .create_sub_task("T-1", SubTaskData { title: "b".into(), ..SubTaskData::default() })
            .await
            .unwrap();

        assert_eq!(a, "T-1.1");
        assert_eq!(b, "T-1.2");
        let created = backend.created_sub_tasks();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].0, "T-1");
        assert_eq!(created[1].1.title, "b");
    }

    #[tokio::test]
    async fn test_mock_backend_with_error() {
        let backend = MockTaskBackend::new().with_error("offline");
        assert!(backend.get_task("T-1").await.is_err());
        assert!(backend
            .create_sub_task("T-1", SubTaskData::default())
            .await
            .is_err());
        assert!(backend.created_sub_tasks().is_empty());
    }

    // =========================================================================
    // Mock Remediation Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_remediation_succeeds_by_default() {
        let fix = MockRemediation::new("restart");
        assert_eq!(fix.name(), "restart");
        assert!(fix.apply(&action()).await.is_ok());
        assert_eq!(fix.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_remediation_fail_count() {
        let fix = MockRemediation::new("restart").with_fail_count(2);
        assert!(fix.apply(&action()).await.is_err());
        assert!(fix.apply(&action()).await.is_err());
        assert!(fix.apply(&action()).await.is_ok());
        assert_eq!(fix.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_remediation_always_fails() {
        let fix = MockRemediation::new("restart").with_error("disk full");
        let err = fix.apply(&action()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
