//! Optimistic send pipeline: draft -> provisional entry -> upload -> insert
//! -> reconcile (or Failed, with explicit retry).
//!
//! The staging rule is strict: an attachment uploads *before* the row
//! insert, so a durable row never references an unresolved attachment. A
//! successful upload is cached on the pending send and reused by retry — a
//! pure persistence failure does not re-upload.

use chrono::Utc;
use uuid::Uuid;

use atelier_store::AttachmentUpload;
use atelier_types::models::{Attachment, Message, MessageId};

use crate::error::SendError;

/// What the user composed.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub content: String,
    pub attachment: Option<AttachmentUpload>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
        }
    }

    /// Empty-or-whitespace content with no attachment is rejected before
    /// anything is appended to the timeline.
    pub fn validate(&self) -> Result<(), SendError> {
        if self.content.trim().is_empty() && self.attachment.is_none() {
            return Err(SendError::EmptyDraft);
        }
        Ok(())
    }
}

/// Book-keeping for an in-flight or failed send, keyed by its temp id.
/// Survives a failure so retry can reuse the content and any already
/// uploaded attachment.
#[derive(Debug, Clone)]
pub(crate) struct PendingSend {
    pub content: String,
    /// Original payload, kept until the upload succeeds (needed again only
    /// if the *upload* failed).
    pub upload: Option<AttachmentUpload>,
    /// Resolved attachment from a successful upload; reused on retry.
    pub uploaded: Option<Attachment>,
}

impl PendingSend {
    pub fn new(draft: &Draft) -> Self {
        Self {
            content: draft.content.clone(),
            upload: draft.attachment.clone(),
            uploaded: None,
        }
    }
}

/// Build the provisional message: a local id, the client clock, and the
/// local preview standing in for the attachment so the UI renders without
/// waiting on the network.
pub(crate) fn optimistic_message(
    conversation_id: Uuid,
    sender_id: Uuid,
    draft: &Draft,
) -> Message {
    let attachment = draft.attachment.as_ref().map(|up| Attachment {
        storage_ref: String::new(),
        url: up.local_preview.clone(),
        kind: up.kind,
        name: up.name.clone(),
    });

    Message {
        id: MessageId::new_local(),
        conversation_id,
        sender_id,
        content: draft.content.clone(),
        created_at: Utc::now(),
        attachment,
        deleted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::models::AttachmentKind;

    #[test]
    fn whitespace_only_draft_is_rejected() {
        assert!(matches!(
            Draft::text("   \n\t").validate(),
            Err(SendError::EmptyDraft)
        ));
        assert!(Draft::text("hello").validate().is_ok());
    }

    #[test]
    fn attachment_alone_is_a_valid_draft() {
        let draft = Draft {
            content: String::new(),
            attachment: Some(AttachmentUpload {
                name: "sketch.png".into(),
                kind: AttachmentKind::Image,
                bytes: vec![1, 2, 3],
                local_preview: Some("blob:sketch".into()),
            }),
        };
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn optimistic_message_carries_the_local_preview() {
        let draft = Draft {
            content: "wip".into(),
            attachment: Some(AttachmentUpload {
                name: "cut.mp4".into(),
                kind: AttachmentKind::Video,
                bytes: vec![0; 16],
                local_preview: Some("blob:cut".into()),
            }),
        };
        let msg = optimistic_message(Uuid::new_v4(), Uuid::new_v4(), &draft);

        assert!(msg.id.is_local());
        let att = msg.attachment.unwrap();
        assert_eq!(att.url.as_deref(), Some("blob:cut"));
        assert!(att.storage_ref.is_empty());
    }
}
