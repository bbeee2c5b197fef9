use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Change-feed events delivered for a conversation.
///
/// Delivery is at-least-once with best-effort ordering — consumers must
/// treat a redelivered event as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// A new message row was committed.
    Inserted(Message),

    /// An existing row changed. The only mutation the engine cares about is
    /// the soft-delete flag; other updates are ignored.
    Updated(Message),
}

impl FeedEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::Inserted(m) | Self::Updated(m) => m.conversation_id,
        }
    }
}

/// A participant moved their "read up to" marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatermarkEvent {
    pub conversation_id: Uuid,
    pub participant_id: Uuid,
    pub last_read_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageId;

    #[test]
    fn feed_events_use_the_tagged_envelope() {
        let msg = Message {
            id: MessageId::Durable(Uuid::nil()),
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            content: "hi".into(),
            created_at: Utc::now(),
            attachment: None,
            deleted: false,
        };
        let json = serde_json::to_value(FeedEvent::Inserted(msg)).unwrap();
        assert_eq!(json["type"], "Inserted");
        assert_eq!(json["data"]["content"], "hi");

        let back: FeedEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, FeedEvent::Inserted(_)));
    }
}
