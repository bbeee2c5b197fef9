//! Real-time chat synchronization engine.
//!
//! Keeps a per-conversation message timeline consistent across four
//! independent delivery channels: locally-issued optimistic sends, a
//! backward-paginated history window, a live change feed, and read-receipt
//! watermarks — while the viewport may be scrolled anywhere and the feed may
//! drop and resubscribe.
//!
//! Correctness rests on one rule: every insertion path funnels through a
//! single dedup-by-id upsert, so delivery order and redelivery never change
//! the final timeline.

pub mod error;
pub mod pagination;
pub mod receipts;
pub mod send;
pub mod session;
pub mod timeline;
pub mod viewport;

pub use error::SendError;
pub use pagination::{Paginator, ScrollAnchor};
pub use receipts::{FocusFlag, FocusState, ReadReceipts};
pub use send::Draft;
pub use session::{ChatSession, EntrySnapshot, PageLoad, SessionConfig, SessionSignal, TimelineSnapshot};
pub use timeline::{LiveOutcome, Timeline, TimelineEntry};
pub use viewport::{ArrivalAction, ViewTracker, ViewportMetrics};
