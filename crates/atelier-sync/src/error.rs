use atelier_types::models::MessageId;

/// User-visible failures of the send pipeline.
///
/// Only these reach the UI (inline failure affordance with retry).
/// Pagination and subscription failures are recovered locally and logged —
/// the engine favors a usable UI over surfacing transient connectivity
/// noise.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Rejected locally; never reaches the network.
    #[error("message is empty and has no attachment")]
    EmptyDraft,

    /// Double-submit suppression for the compose slot.
    #[error("a send is already in flight for this conversation")]
    SendInFlight,

    #[error("no active conversation")]
    NoConversation,

    /// Attachment transport failure. The row insert never ran, so there is
    /// no partial insert to clean up.
    #[error("attachment upload failed")]
    Upload(#[source] anyhow::Error),

    /// Row insert failure after a successful (or absent) upload.
    #[error("message insert failed")]
    Persistence(#[source] anyhow::Error),

    /// The conversation switched while the send was in flight; the result
    /// was discarded.
    #[error("conversation changed before the send completed")]
    StaleConversation,

    #[error("no failed message {0} to retry")]
    UnknownRetry(MessageId),
}
