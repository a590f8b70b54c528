//! Broadcast channel for live moderation events.
//!
//! At-most-once, fire-and-forget: an event is an optimization for connected
//! UIs (the gateway forwards them as SSE), never a correctness dependency.
//! Publishing after the authoritative write has committed is the caller's
//! responsibility — the engine emits only for state changes that durably
//! happened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Event payloads pushed to connected clients when moderation state changes.
/// Tag names mirror the socket topics the frontend listens on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModerationEvent {
    /// A warning was recorded or removed; carries the new counter.
    WarningUpdated {
        roll: String,
        warning_count: u32,
        locked_until: Option<DateTime<Utc>>,
    },
    /// An account-level lock was applied (manual or auto).
    StudentLocked {
        roll: String,
        reason: String,
        expires_at: DateTime<Utc>,
    },
    /// An account-level lock was cleared.
    StudentUnlocked { roll: String, by: String },
    /// A chatbot-only restriction was applied.
    ChatbotRestricted {
        roll: String,
        reason: String,
        expires_at: DateTime<Utc>,
    },
    /// Administrative global lock engaged.
    ChatLocked,
    /// Administrative global lock released.
    ChatUnlocked,
    /// A new appeal was submitted.
    AppealNew { roll: String, appeal_id: String },
}

/// Cloneable handle over the broadcast channel.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ModerationEvent>,
}

impl Notifier {
    /// Creates a notifier with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new listener (e.g. one SSE connection).
    pub fn subscribe(&self) -> broadcast::Receiver<ModerationEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event to all listeners. A send error only means nobody is
    /// listening right now; that is not a failure.
    pub fn publish(&self, event: ModerationEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!("moderation event dropped (no subscribers): {}", e);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.publish(ModerationEvent::ChatLocked);
        match rx.recv().await.unwrap() {
            ModerationEvent::ChatLocked => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let notifier = Notifier::new(8);
        notifier.publish(ModerationEvent::ChatUnlocked);
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let json = serde_json::to_value(ModerationEvent::StudentUnlocked {
            roll: "22CS101".to_string(),
            by: "admin1".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "student_unlocked");
        assert_eq!(json["roll"], "22CS101");
    }
}
