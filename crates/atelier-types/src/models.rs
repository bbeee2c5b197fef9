use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a message in the timeline.
///
/// Durable ids are assigned by the backing store and are stable forever.
/// Local ids are minted on the client for optimistic entries and live in a
/// separate namespace, so a local id can never collide with a durable one.
/// A local id is discarded the moment the durable row is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum MessageId {
    Durable(Uuid),
    Local(Uuid),
}

impl MessageId {
    /// Mint a fresh local id for an optimistic entry.
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Durable(id) => write!(f, "{}", id),
            Self::Local(id) => write!(f, "local:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

/// A file attached to a message.
///
/// `url` is filled in lazily: rows come back from the store with only the
/// storage reference, and display URLs are resolved in a single batch per
/// page rather than one request per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub storage_ref: String,
    pub url: Option<String>,
    pub kind: AttachmentKind,
    pub name: String,
}

/// A single message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachment: Option<Attachment>,
    /// Soft-delete flag. Deleted rows are hidden from every client.
    pub deleted: bool,
}

/// Delivery lifecycle of a timeline entry.
///
/// `Failed -> Optimistic` (user retry) is the only back-edge; everything
/// else moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Optimistic,
    Failed,
    Confirmed,
}

/// A two-participant container for a message timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_ids: [Uuid; 2],
    pub updated_at: DateTime<Utc>,
    pub pinned_by_me: bool,
    pub hidden_by_me: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("user {user_id} is not a participant of conversation {conversation_id}")]
pub struct NotAParticipant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
}

impl Conversation {
    /// Resolve the single "other user" for the given actor.
    pub fn other_participant(&self, self_id: Uuid) -> Result<Uuid, NotAParticipant> {
        let [a, b] = self.participant_ids;
        if a == self_id {
            Ok(b)
        } else if b == self_id {
            Ok(a)
        } else {
            Err(NotAParticipant {
                conversation_id: self.id,
                user_id: self_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_never_equal_durable_ids() {
        let raw = Uuid::new_v4();
        assert_ne!(MessageId::Local(raw), MessageId::Durable(raw));
    }

    #[test]
    fn other_participant_resolves_both_directions() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conv = Conversation {
            id: Uuid::new_v4(),
            participant_ids: [a, b],
            updated_at: Utc::now(),
            pinned_by_me: false,
            hidden_by_me: false,
        };
        assert_eq!(conv.other_participant(a).unwrap(), b);
        assert_eq!(conv.other_participant(b).unwrap(), a);
        assert!(conv.other_participant(Uuid::new_v4()).is_err());
    }
}
