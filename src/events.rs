//! Outbound notifications for status displays.
//!
//! Payloads carry identifiers, counts and locations only. No variant has a
//! field that could hold secret material.

use crate::cleanup::operation::CleanupStatus;
use crate::cleanup::trigger::TriggerReason;
use crate::cleanup::validator::ValidationScope;
use crate::core::models::ProcessState;
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardNotification {
    ProcessStarted {
        pid: u32,
        name: String,
        parent_pid: Option<u32>,
        ai_tool: bool,
    },
    ProcessExited {
        pid: u32,
        name: Option<String>,
        state: ProcessState,
    },
    CleanupStarted {
        session: String,
        reason: TriggerReason,
        targets: usize,
    },
    CleanupCompleted {
        session: String,
        status: CleanupStatus,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    ValidationFailed {
        session: Option<String>,
        scope: ValidationScope,
        findings: usize,
    },
    AuditIntegrityBroken {
        sequence: u64,
    },
}

/// Fan-out channel for [`GuardNotification`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<GuardNotification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardNotification> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, notification: GuardNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let bus = NotificationBus::default();
        let mut rx = bus.subscribe();
        bus.publish(GuardNotification::AuditIntegrityBroken { sequence: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            GuardNotification::AuditIntegrityBroken { sequence: 3 }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = NotificationBus::new(4);
        bus.publish(GuardNotification::ProcessExited {
            pid: 1,
            name: None,
            state: ProcessState::Exited,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_string(&GuardNotification::ProcessStarted {
            pid: 7,
            name: "claude".into(),
            parent_pid: None,
            ai_tool: true,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"process_started\""));
    }
}
