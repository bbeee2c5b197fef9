pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use atelier_types::events::{FeedEvent, WatermarkEvent};
use atelier_types::models::{Attachment, AttachmentKind, Conversation, Message};

/// A file handed to the upload endpoint.
///
/// `local_preview` is a handle the UI can already render (e.g. a blob URL for
/// a file still on disk); it never reaches the store and only rides along so
/// an optimistic entry can show the attachment before the upload finishes.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub name: String,
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
    pub local_preview: Option<String>,
}

/// Contract the sync engine consumes from the backing platform.
///
/// The store is expected to hand out ordered, timestamped rows and an
/// at-least-once change feed. Everything here is an external collaborator:
/// how rows are persisted or pushed is not the engine's concern.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fetch up to `limit` rows, newest first. With `before` set, only rows
    /// strictly older than the cursor are returned.
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>>;

    /// Insert a durable row. The store assigns the id and timestamp.
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message>;

    /// Soft-delete a row. Deleted rows are hidden from all clients.
    async fn soft_delete_message(&self, id: Uuid) -> Result<()>;

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation>;

    /// Bump the conversation's `updated_at` so sidebar ordering follows the
    /// latest activity.
    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Attachment>;

    /// Resolve display URLs for a batch of storage refs in one round trip.
    async fn resolve_attachment_urls(&self, refs: &[String]) -> Result<HashMap<String, String>>;

    async fn get_read_watermark(
        &self,
        conversation_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Move a participant's watermark forward. Implementations must keep it
    /// monotonic non-decreasing.
    async fn set_read_watermark(
        &self,
        conversation_id: Uuid,
        participant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Subscribe to the conversation's change feed. At-least-once delivery;
    /// a dropped receiver simply stops getting events.
    fn subscribe_events(&self, conversation_id: Uuid) -> broadcast::Receiver<FeedEvent>;

    /// Subscribe to watermark updates for the conversation.
    fn subscribe_watermarks(&self, conversation_id: Uuid) -> broadcast::Receiver<WatermarkEvent>;
}
