//! In-memory `ChatBackend` for tests and local embedding.
//!
//! Rows live in per-conversation vectors ordered by `created_at`; change
//! feeds are tokio broadcast channels, one per conversation, created lazily
//! on first use. Fault toggles let tests fail exactly one upcoming call to
//! exercise the engine's failure paths without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use atelier_types::events::{FeedEvent, WatermarkEvent};
use atelier_types::models::{Attachment, Conversation, Message, MessageId};

use crate::{AttachmentUpload, ChatBackend};

/// Broadcast buffer per conversation. Slow receivers see `Lagged`, which the
/// engine treats the same as a missed-event gap.
const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    /// Per conversation, ascending `created_at`.
    messages: HashMap<Uuid, Vec<Message>>,
    /// (conversation_id, participant_id) -> last_read_at.
    watermarks: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    /// storage_ref -> byte size, for uploaded attachments.
    uploads: HashMap<String, usize>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    feeds: Mutex<HashMap<Uuid, broadcast::Sender<FeedEvent>>>,
    watermark_feeds: Mutex<HashMap<Uuid, broadcast::Sender<WatermarkEvent>>>,
    url_base: String,

    // One-shot fault toggles for tests.
    fail_next_fetch: AtomicBool,
    fail_next_insert: AtomicBool,
    fail_next_upload: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            feeds: Mutex::new(HashMap::new()),
            watermark_feeds: Mutex::new(HashMap::new()),
            url_base: "https://cdn.atelier.test".into(),
            fail_next_fetch: AtomicBool::new(false),
            fail_next_insert: AtomicBool::new(false),
            fail_next_upload: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn feed(&self, conversation_id: Uuid) -> broadcast::Sender<FeedEvent> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn watermark_feed(&self, conversation_id: Uuid) -> broadcast::Sender<WatermarkEvent> {
        let mut feeds = self
            .watermark_feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        feeds
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    /// Create a two-participant conversation.
    pub fn create_conversation(&self, a: Uuid, b: Uuid) -> Conversation {
        let conv = Conversation {
            id: Uuid::new_v4(),
            participant_ids: [a, b],
            updated_at: Utc::now(),
            pinned_by_me: false,
            hidden_by_me: false,
        };
        self.state().conversations.insert(conv.id, conv.clone());
        conv
    }

    /// Insert a historical row with an explicit timestamp, without emitting
    /// a feed event. Used to build up history for pagination tests.
    pub fn seed_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let msg = Message {
            id: MessageId::Durable(Uuid::new_v4()),
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at,
            attachment: None,
            deleted: false,
        };
        let mut state = self.state();
        let rows = state.messages.entry(conversation_id).or_default();
        let pos = rows.partition_point(|m| m.created_at <= created_at);
        rows.insert(pos, msg.clone());
        msg
    }

    /// Push a raw feed event, bypassing the store. Lets tests replay
    /// duplicates and out-of-order deliveries the way a flaky transport
    /// would.
    pub fn broadcast_event(&self, conversation_id: Uuid, event: FeedEvent) {
        let _ = self.feed(conversation_id).send(event);
    }

    /// Fail the next `fetch_messages` call, once.
    pub fn fail_next_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    /// Fail the next `insert_message` call, once.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// Fail the next `upload_attachment` call, once.
    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, Ordering::SeqCst);
    }

    /// Number of attachments uploaded so far.
    pub fn upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    /// Count of non-deleted rows in a conversation.
    pub fn message_count(&self, conversation_id: Uuid) -> usize {
        self.state()
            .messages
            .get(&conversation_id)
            .map(|rows| rows.iter().filter(|m| !m.deleted).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            bail!("injected fetch failure");
        }

        let state = self.state();
        let rows = state.messages.get(&conversation_id);
        let out: Vec<Message> = rows
            .map(|rows| {
                rows.iter()
                    .rev() // newest first
                    .filter(|m| !m.deleted)
                    .filter(|m| before.is_none_or(|cursor| m.created_at < cursor))
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            conversation = %conversation_id,
            rows = out.len(),
            "fetch_messages"
        );
        Ok(out)
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            bail!("injected insert failure");
        }

        let msg = Message {
            id: MessageId::Durable(Uuid::new_v4()),
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
            attachment,
            deleted: false,
        };

        {
            let mut state = self.state();
            if !state.conversations.contains_key(&conversation_id) {
                bail!("unknown conversation {}", conversation_id);
            }
            state
                .messages
                .entry(conversation_id)
                .or_default()
                .push(msg.clone());
        }

        // Echo to every subscriber, the sender's own client included.
        let _ = self.feed(conversation_id).send(FeedEvent::Inserted(msg.clone()));

        Ok(msg)
    }

    async fn soft_delete_message(&self, id: Uuid) -> Result<()> {
        let updated = {
            let mut state = self.state();
            let mut found = None;
            for rows in state.messages.values_mut() {
                if let Some(row) = rows
                    .iter_mut()
                    .find(|m| m.id == MessageId::Durable(id))
                {
                    row.deleted = true;
                    found = Some(row.clone());
                    break;
                }
            }
            found.ok_or_else(|| anyhow!("message {} not found", id))?
        };

        let _ = self
            .feed(updated.conversation_id)
            .send(FeedEvent::Updated(updated));
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.state()
            .conversations
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("conversation {} not found", id))
    }

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let conv = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("conversation {} not found", id))?;
        if at > conv.updated_at {
            conv.updated_at = at;
        }
        Ok(())
    }

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Attachment> {
        if self.fail_next_upload.swap(false, Ordering::SeqCst) {
            bail!("injected upload failure");
        }

        let storage_ref = format!("att/{}", Uuid::new_v4());
        self.state()
            .uploads
            .insert(storage_ref.clone(), upload.bytes.len());

        Ok(Attachment {
            url: Some(format!("{}/{}", self.url_base, storage_ref)),
            storage_ref,
            kind: upload.kind,
            name: upload.name,
        })
    }

    async fn resolve_attachment_urls(&self, refs: &[String]) -> Result<HashMap<String, String>> {
        let state = self.state();
        Ok(refs
            .iter()
            .filter(|r| state.uploads.contains_key(*r))
            .map(|r| (r.clone(), format!("{}/{}", self.url_base, r)))
            .collect())
    }

    async fn get_read_watermark(
        &self,
        conversation_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .watermarks
            .get(&(conversation_id, participant_id))
            .copied())
    }

    async fn set_read_watermark(
        &self,
        conversation_id: Uuid,
        participant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let advanced = {
            let mut state = self.state();
            let slot = state
                .watermarks
                .entry((conversation_id, participant_id))
                .or_insert(at);
            // Monotonic: never move a watermark backwards.
            if at >= *slot {
                *slot = at;
                true
            } else {
                false
            }
        };

        if advanced {
            let _ = self.watermark_feed(conversation_id).send(WatermarkEvent {
                conversation_id,
                participant_id,
                last_read_at: at,
            });
        }
        Ok(())
    }

    fn subscribe_events(&self, conversation_id: Uuid) -> broadcast::Receiver<FeedEvent> {
        self.feed(conversation_id).subscribe()
    }

    fn subscribe_watermarks(&self, conversation_id: Uuid) -> broadcast::Receiver<WatermarkEvent> {
        self.watermark_feed(conversation_id).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_is_newest_first_and_respects_cursor() {
        let backend = MemoryBackend::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conv = backend.create_conversation(a, b);

        let base = Utc::now();
        for i in 0..5 {
            backend.seed_message(
                conv.id,
                a,
                &format!("m{}", i),
                base + chrono::Duration::seconds(i),
            );
        }

        let newest = backend.fetch_messages(conv.id, None, 2).await.unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].content, "m4");
        assert_eq!(newest[1].content, "m3");

        let older = backend
            .fetch_messages(conv.id, Some(newest[1].created_at), 10)
            .await
            .unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].content, "m2");
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let backend = MemoryBackend::new();
        let a = Uuid::new_v4();
        let conv = backend.create_conversation(a, Uuid::new_v4());

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(10);

        backend.set_read_watermark(conv.id, a, later).await.unwrap();
        backend.set_read_watermark(conv.id, a, earlier).await.unwrap();

        let wm = backend.get_read_watermark(conv.id, a).await.unwrap();
        assert_eq!(wm, Some(later));
    }

    #[tokio::test]
    async fn insert_echoes_to_subscribers() {
        let backend = MemoryBackend::new();
        let a = Uuid::new_v4();
        let conv = backend.create_conversation(a, Uuid::new_v4());

        let mut rx = backend.subscribe_events(conv.id);
        let sent = backend
            .insert_message(conv.id, a, "hello", None)
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            FeedEvent::Inserted(m) => assert_eq!(m.id, sent.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
