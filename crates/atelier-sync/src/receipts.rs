//! Bidirectional read-receipt tracking.
//!
//! Each participant owns a monotonic "read up to" watermark. A message the
//! current user sent is read by the peer iff the peer's watermark is at or
//! past its timestamp. Publishing the local watermark is gated on an
//! injected focus capability — a backgrounded tab must never mark messages
//! read.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use atelier_types::events::WatermarkEvent;
use atelier_types::models::Message;

/// Whether the app is foregrounded and focused. Injected so the tracker is
/// testable without a real window.
pub trait FocusState: Send + Sync {
    fn is_focused(&self) -> bool;
}

/// Plain shared-flag implementation; the shell flips it on focus/blur and
/// visibility changes.
#[derive(Debug, Default)]
pub struct FocusFlag {
    focused: AtomicBool,
}

impl FocusFlag {
    pub fn new(focused: bool) -> Self {
        Self {
            focused: AtomicBool::new(focused),
        }
    }

    pub fn set(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }
}

impl FocusState for FocusFlag {
    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }
}

/// Watermarks for one active conversation. Re-initialized on every switch.
#[derive(Debug)]
pub struct ReadReceipts {
    self_id: Uuid,
    peer_id: Uuid,
    peer_watermark: Option<DateTime<Utc>>,
    own_watermark: Option<DateTime<Utc>>,
}

impl ReadReceipts {
    pub fn new(self_id: Uuid, peer_id: Uuid) -> Self {
        Self {
            self_id,
            peer_id,
            peer_watermark: None,
            own_watermark: None,
        }
    }

    pub fn peer_watermark(&self) -> Option<DateTime<Utc>> {
        self.peer_watermark
    }

    /// Seed or advance the peer watermark. Never moves backwards.
    pub fn advance_peer(&mut self, at: DateTime<Utc>) {
        if self.peer_watermark.is_none_or(|cur| at > cur) {
            self.peer_watermark = Some(at);
        }
    }

    /// Record our own published watermark (for local display of the sidebar
    /// unread divider). Monotonic like the peer's.
    pub fn advance_own(&mut self, at: DateTime<Utc>) {
        if self.own_watermark.is_none_or(|cur| at > cur) {
            self.own_watermark = Some(at);
        }
    }

    /// Fold in a live watermark update for this conversation.
    pub fn apply_event(&mut self, event: &WatermarkEvent) {
        if event.participant_id == self.peer_id {
            self.advance_peer(event.last_read_at);
        } else if event.participant_id == self.self_id {
            self.advance_own(event.last_read_at);
        }
    }

    /// Read-status is only meaningful for the current user's own sends.
    pub fn is_read(&self, message: &Message) -> bool {
        message.sender_id == self.self_id
            && self
                .peer_watermark
                .is_some_and(|wm| wm >= message.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::models::MessageId;
    use chrono::Duration;

    fn msg(sender: Uuid, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::Durable(Uuid::new_v4()),
            conversation_id: Uuid::nil(),
            sender_id: sender,
            content: "x".into(),
            created_at: at,
            attachment: None,
            deleted: false,
        }
    }

    #[test]
    fn read_flips_exactly_at_the_watermark() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut receipts = ReadReceipts::new(me, peer);

        let t1 = Utc::now();
        let mine = msg(me, t1);

        assert!(!receipts.is_read(&mine));
        receipts.advance_peer(t1 - Duration::seconds(1));
        assert!(!receipts.is_read(&mine));
        receipts.advance_peer(t1);
        assert!(receipts.is_read(&mine));
    }

    #[test]
    fn never_read_for_peer_authored_messages() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut receipts = ReadReceipts::new(me, peer);

        let theirs = msg(peer, Utc::now() - Duration::hours(1));
        receipts.advance_peer(Utc::now());
        assert!(!receipts.is_read(&theirs));
    }

    #[test]
    fn peer_watermark_is_monotonic() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut receipts = ReadReceipts::new(me, peer);

        let later = Utc::now();
        receipts.advance_peer(later);
        receipts.apply_event(&WatermarkEvent {
            conversation_id: Uuid::nil(),
            participant_id: peer,
            last_read_at: later - Duration::minutes(2),
        });
        assert_eq!(receipts.peer_watermark(), Some(later));
    }

    #[test]
    fn events_route_by_participant() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut receipts = ReadReceipts::new(me, peer);
        let at = Utc::now();

        receipts.apply_event(&WatermarkEvent {
            conversation_id: Uuid::nil(),
            participant_id: me,
            last_read_at: at,
        });
        // Our own publish must not count as the peer reading.
        assert_eq!(receipts.peer_watermark(), None);
    }
}
