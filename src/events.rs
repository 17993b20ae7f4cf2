//! Healing and lifecycle notifications.
//!
//! Components publish [`MonitorEvent`]s to a shared [`EventBus`]; any number
//! of subscribers receive them. Dropping a receiver unsubscribes it.
//! Publishing with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::actions::ActionResult;
use crate::circuit::CircuitState;
use crate::patterns::Severity;
use crate::recovery::{ExitReason, RecoveryStrategy};
use crate::verify::CheckType;

/// Default number of buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// Something the monitor did or observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MonitorEvent {
    LineClassified {
        pattern: String,
        severity: Severity,
        line: String,
    },
    UnknownError {
        line: String,
    },
    ActionExecuted {
        result: ActionResult,
    },
    ActionBlocked {
        action: String,
        pattern: String,
        circuit: CircuitState,
    },
    CleanExit {
        line: String,
    },
    Notification {
        severity: Severity,
        message: String,
    },
    StaleSession {
        idle_ms: u64,
    },
    LifetimeExceeded {
        uptime_ms: u64,
    },
    VerificationCompleted {
        claim: String,
        passed: bool,
        failed_checks: Vec<CheckType>,
    },
    RecoveryPlanned {
        task_id: String,
        exit_reason: ExitReason,
        strategy: RecoveryStrategy,
    },
    RecoverySkipped {
        task_id: String,
        exit_reason: ExitReason,
        reason: String,
    },
    SubTasksCreated {
        parent_id: String,
        ids: Vec<String>,
    },
    TailerError {
        message: String,
    },
    Stopped {
        reason: String,
    },
}

/// Broadcast channel for [`MonitorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        if self.tx.send(event).is_err() {
            trace!("[healer] No event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(MonitorEvent::Stopped {
            reason: "test".into(),
        });

        assert!(matches!(a.recv().await.unwrap(), MonitorEvent::Stopped { .. }));
        assert!(matches!(b.recv().await.unwrap(), MonitorEvent::Stopped { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(MonitorEvent::TailerError {
            message: "gone".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&MonitorEvent::StaleSession { idle_ms: 5 }).unwrap();
        assert_eq!(json, r#"{"event":"stale-session","idle_ms":5}"#);
    }
}
