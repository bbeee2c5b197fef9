//! Ordered, deduplicated in-memory timeline for the active conversation.
//!
//! Every insertion path — initial page, backward page, live event,
//! optimistic append — goes through [`Timeline::upsert`], so a row delivered
//! by any number of channels renders exactly once, and the final order is a
//! pure function of `created_at` (ties keep arrival order).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use atelier_types::models::{DeliveryState, Message, MessageId};

/// One rendered row: the message plus its delivery lifecycle.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: Message,
    pub state: DeliveryState,
}

/// Outcome of folding a live insert into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// The id was already present; the row replaced it in place.
    Replaced,
    /// The row is the current user's own echo with no matching entry — the
    /// optimistic/reconciled entry already represents it, so it was dropped.
    DroppedOwnEcho,
    /// A previously unseen peer row, inserted at its sorted position.
    InsertedFromPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upserted {
    Inserted,
    Replaced,
}

pub struct Timeline {
    self_id: Uuid,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(self_id: Uuid) -> Self {
        Self {
            self_id,
            entries: Vec::new(),
        }
    }

    /// Discard everything. A driver that keeps one `Timeline` across
    /// conversation switches calls this instead of rebuilding.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn get(&self, id: &MessageId) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.message.id == *id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    /// `created_at` of the oldest durable row currently loaded — the cursor
    /// for the next backward page. Optimistic entries don't count: they have
    /// no durable timestamp yet and are never older than history.
    pub fn oldest_loaded_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| !e.message.id.is_local())
            .map(|e| e.message.created_at)
    }

    /// The single merge funnel. Replaces in place on an id match, otherwise
    /// inserts at the sorted position (after any equal timestamps, so equal
    /// `created_at` keeps arrival order).
    fn upsert(&mut self, message: Message, state: DeliveryState) -> Upserted {
        if let Some(idx) = self.position(&message.id) {
            self.entries[idx] = TimelineEntry { message, state };
            return Upserted::Replaced;
        }
        let at = message.created_at;
        let idx = self
            .entries
            .partition_point(|e| e.message.created_at <= at);
        self.entries.insert(idx, TimelineEntry { message, state });
        Upserted::Inserted
    }

    /// Fold in the newest page after a conversation switch. Rows arrive
    /// newest-first from the store.
    pub fn load_initial_page(&mut self, rows: Vec<Message>) {
        for row in rows.into_iter().rev().filter(|row| !row.deleted) {
            self.upsert(row, DeliveryState::Confirmed);
        }
    }

    /// Fold in an older page. Returns how many rows were actually new —
    /// overlap with already-loaded history dedups silently.
    pub fn prepend_page(&mut self, rows: Vec<Message>) -> usize {
        rows.into_iter()
            .filter(|row| !row.deleted)
            .map(|row| self.upsert(row, DeliveryState::Confirmed))
            .filter(|u| *u == Upserted::Inserted)
            .count()
    }

    /// Fold in a live insert event.
    pub fn upsert_from_live(&mut self, row: Message) -> LiveOutcome {
        if self.position(&row.id).is_some() {
            self.upsert(row, DeliveryState::Confirmed);
            return LiveOutcome::Replaced;
        }
        if row.sender_id == self.self_id {
            // Own echo: the optimistic (or already reconciled) entry is the
            // canonical rendering; inserting the echo would duplicate it.
            return LiveOutcome::DroppedOwnEcho;
        }
        self.upsert(row, DeliveryState::Confirmed);
        LiveOutcome::InsertedFromPeer
    }

    /// Remove a message from the visible timeline entirely. Soft-deleted
    /// rows are hidden from all clients — no tombstone.
    pub fn mark_deleted(&mut self, id: &MessageId) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Insert a provisional entry carrying a local id. The caller builds the
    /// message (local preview attachment included) so the UI renders without
    /// waiting on the network.
    pub fn append_optimistic(&mut self, message: Message) -> MessageId {
        debug_assert!(message.id.is_local());
        let id = message.id;
        self.upsert(message, DeliveryState::Optimistic);
        id
    }

    /// Replace a temp id with the durable row once the insert is confirmed.
    /// Returns false if the temp entry is gone (e.g. conversation switched).
    pub fn reconcile(&mut self, temp_id: &MessageId, row: Message) -> bool {
        let Some(idx) = self.position(temp_id) else {
            return false;
        };
        self.entries.remove(idx);
        // Re-insert through the funnel: the durable timestamp decides the
        // final position, and a live echo that slipped in first dedups here.
        self.upsert(row, DeliveryState::Confirmed);
        true
    }

    /// Transition an optimistic entry to Failed.
    pub fn mark_failed(&mut self, temp_id: &MessageId) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == *temp_id) {
            Some(entry) => {
                entry.state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// `Failed -> Optimistic`, the one back-edge in the lifecycle (explicit
    /// user retry).
    pub fn begin_retry(&mut self, temp_id: &MessageId) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == *temp_id) {
            Some(entry) if entry.state == DeliveryState::Failed => {
                entry.state = DeliveryState::Optimistic;
                true
            }
            _ => false,
        }
    }

    /// Storage refs of attachments that still need a display URL.
    pub fn attachments_missing_urls(&self) -> Vec<(MessageId, String)> {
        self.entries
            .iter()
            .filter_map(|e| {
                let att = e.message.attachment.as_ref()?;
                if att.url.is_none() && !att.storage_ref.is_empty() {
                    Some((e.message.id, att.storage_ref.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Patch in a resolved display URL.
    pub fn set_attachment_url(&mut self, id: &MessageId, url: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == *id) {
            if let Some(att) = entry.message.attachment.as_mut() {
                att.url = Some(url);
            }
        }
    }

    /// Swap the attachment on an optimistic entry for the uploaded one
    /// (local preview -> durable storage ref).
    pub fn set_attachment(&mut self, id: &MessageId, attachment: atelier_types::models::Attachment) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == *id) {
            entry.message.attachment = Some(attachment);
        }
    }
}
