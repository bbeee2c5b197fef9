//! Per-conversation orchestration: activation, the live-feed pumps, the
//! send pipeline, scroll-driven pagination, and read publishing.
//!
//! `ChatSession` is a cheap clone-handle over shared inner state. All
//! conversation state lives behind one async mutex and is owned by exactly
//! one active conversation at a time; switching replaces it wholesale.
//! Every asynchronous operation captures the session epoch when it is
//! issued, and its completion is discarded if the epoch has moved on — a
//! stale fetch resolving after a switch must never touch the new state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use atelier_store::ChatBackend;
use atelier_types::events::{FeedEvent, WatermarkEvent};
use atelier_types::models::{Conversation, DeliveryState, Message, MessageId};

use crate::error::SendError;
use crate::pagination::{Paginator, ScrollAnchor};
use crate::receipts::{FocusState, ReadReceipts};
use crate::send::{Draft, PendingSend, optimistic_message};
use crate::timeline::{LiveOutcome, Timeline};
use crate::viewport::{ArrivalAction, ViewTracker, ViewportMetrics};

/// Tunables for one session. Defaults match the product behavior: 30-row
/// pages, load older history within 120px of the top, treat within 40px of
/// the bottom as "following the conversation".
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_size: u32,
    pub top_threshold: f32,
    pub bottom_slack: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            top_threshold: 120.0,
            bottom_slack: 40.0,
        }
    }
}

/// Result of a completed older-page load. The UI commits the prepend, then
/// measures, then applies `anchor.restore(measured_height)` as the new
/// scroll offset.
#[derive(Debug, Clone, Copy)]
pub struct PageLoad {
    /// Rows actually new after dedup.
    pub inserted: usize,
    pub anchor: ScrollAnchor,
}

/// Out-of-band notifications for the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionSignal {
    /// A peer message arrived; auto-scroll or show the badge.
    Arrival(ArrivalAction),
    /// The peer's read watermark advanced; re-derive per-message read state.
    PeerWatermarkAdvanced(DateTime<Utc>),
}

/// A cloneable snapshot of everything the timeline view renders.
#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    pub conversation_id: Uuid,
    pub entries: Vec<EntrySnapshot>,
    pub unread: u32,
    pub has_more: bool,
    pub loading_older: bool,
}

#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub message: Message,
    pub state: DeliveryState,
    /// Peer watermark at or past this message's timestamp. Only ever true
    /// for the current user's own sends.
    pub read_by_peer: bool,
}

/// State owned by the currently active conversation. Replaced wholesale on
/// switch — nothing is shared across conversations.
struct Active {
    conversation: Conversation,
    epoch: u64,
    timeline: Timeline,
    paginator: Paginator,
    receipts: ReadReceipts,
    view: ViewTracker,
    /// Compose-slot guard: suppresses double-submit.
    send_in_flight: bool,
    /// In-flight / failed sends keyed by temp id, kept for retry.
    pending: HashMap<MessageId, PendingSend>,
}

struct SessionInner {
    backend: Arc<dyn ChatBackend>,
    self_id: Uuid,
    config: SessionConfig,
    focus: Arc<dyn FocusState>,
    /// Generation counter; bumped by every `activate`.
    epoch_tx: watch::Sender<u64>,
    state: Mutex<Option<Active>>,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    signals_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionSignal>>>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        self_id: Uuid,
        focus: Arc<dyn FocusState>,
        config: SessionConfig,
    ) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SessionInner {
                backend,
                self_id,
                config,
                focus,
                epoch_tx,
                state: Mutex::new(None),
                signals_tx,
                signals_rx: StdMutex::new(Some(signals_rx)),
            }),
        }
    }

    pub fn self_id(&self) -> Uuid {
        self.inner.self_id
    }

    /// Current activation generation.
    pub fn epoch(&self) -> u64 {
        *self.inner.epoch_tx.borrow()
    }

    /// Take the signal receiver. Single consumer; returns `None` after the
    /// first call.
    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<SessionSignal>> {
        self.inner
            .signals_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn emit(&self, signal: SessionSignal) {
        let _ = self.inner.signals_tx.send(signal);
    }

    /// Switch to a conversation: bump the epoch (invalidating every
    /// in-flight result for the previous one), discard its state, load the
    /// newest page, attach the live pumps, and publish the local read
    /// watermark.
    pub async fn activate(&self, conversation_id: Uuid) -> anyhow::Result<()> {
        let epoch = {
            let next = *self.inner.epoch_tx.borrow() + 1;
            self.inner.epoch_tx.send_replace(next);
            next
        };
        debug!(conversation = %conversation_id, epoch, "activating conversation");

        // Reset-on-switch: the previous timeline is gone before anything
        // about the new conversation is known.
        *self.inner.state.lock().await = None;

        let conversation = self.inner.backend.get_conversation(conversation_id).await?;
        let peer_id = conversation.other_participant(self.inner.self_id)?;

        // Subscribe before the initial fetch so rows committed in between
        // arrive through the feed (the upsert funnel dedups the overlap).
        let feed_rx = self.inner.backend.subscribe_events(conversation_id);
        let watermark_rx = self.inner.backend.subscribe_watermarks(conversation_id);

        let mut paginator = Paginator::new(self.inner.config.page_size);
        let (before, limit) = paginator.begin();
        let rows = self
            .inner
            .backend
            .fetch_messages(conversation_id, before, limit)
            .await?;
        let peer_watermark = self
            .inner
            .backend
            .get_read_watermark(conversation_id, peer_id)
            .await?;

        if self.epoch() != epoch {
            debug!(epoch, "activation superseded before commit; discarding");
            return Ok(());
        }

        let mut timeline = Timeline::new(self.inner.self_id);
        let returned = rows.len();
        timeline.load_initial_page(rows);
        paginator.complete(timeline.oldest_loaded_at(), returned);
        hydrate_urls(self.inner.backend.as_ref(), &mut timeline).await;

        let mut receipts = ReadReceipts::new(self.inner.self_id, peer_id);
        if let Some(at) = peer_watermark {
            receipts.advance_peer(at);
        }

        {
            let mut state = self.inner.state.lock().await;
            if self.epoch() != epoch {
                return Ok(());
            }
            *state = Some(Active {
                conversation,
                epoch,
                timeline,
                paginator,
                receipts,
                view: ViewTracker::new(self.inner.config.bottom_slack),
                send_in_flight: false,
                pending: HashMap::new(),
            });
        }

        tokio::spawn(pump_feed(
            self.clone(),
            epoch,
            feed_rx,
            self.inner.epoch_tx.subscribe(),
        ));
        tokio::spawn(pump_watermarks(
            self.clone(),
            epoch,
            watermark_rx,
            self.inner.epoch_tx.subscribe(),
        ));

        // Conversation open counts as a read trigger.
        self.publish_local_read().await;
        Ok(())
    }

    /// Detach from the active conversation without activating a new one.
    pub async fn deactivate(&self) {
        self.inner.epoch_tx.send_modify(|e| *e += 1);
        *self.inner.state.lock().await = None;
    }

    // -- Live events --

    /// Fold one feed event into the timeline. Public so a driver that owns
    /// its own subscription can push events directly; the spawned pumps go
    /// through here too. Events tagged with a stale epoch are dropped.
    pub async fn apply_feed_event(&self, epoch: u64, event: FeedEvent) -> Option<ArrivalAction> {
        let mut guard = self.inner.state.lock().await;
        let active = guard.as_mut()?;
        if active.epoch != epoch {
            trace!(epoch, current = active.epoch, "dropping stale feed event");
            return None;
        }

        match event {
            FeedEvent::Inserted(row) => {
                if row.deleted {
                    active.timeline.mark_deleted(&row.id);
                    return None;
                }
                match active.timeline.upsert_from_live(row) {
                    LiveOutcome::InsertedFromPeer => {
                        let action = active.view.on_peer_message();
                        hydrate_urls(self.inner.backend.as_ref(), &mut active.timeline).await;
                        // Reading while focused: a peer message that lands in
                        // a focused view is immediately read.
                        if self.inner.focus.is_focused() {
                            publish_read(self.inner.backend.as_ref(), active, self.inner.self_id)
                                .await;
                        }
                        self.emit(SessionSignal::Arrival(action));
                        Some(action)
                    }
                    // Own echoes and redeliveries change nothing the UI
                    // needs to react to.
                    LiveOutcome::Replaced | LiveOutcome::DroppedOwnEcho => None,
                }
            }
            FeedEvent::Updated(row) => {
                // The soft-delete flag is the only mutable field of
                // interest; every other update is ignored.
                if row.deleted {
                    active.timeline.mark_deleted(&row.id);
                }
                None
            }
        }
    }

    /// Fold one watermark event into the receipts.
    pub async fn apply_watermark_event(&self, epoch: u64, event: WatermarkEvent) {
        let mut guard = self.inner.state.lock().await;
        let Some(active) = guard.as_mut() else { return };
        if active.epoch != epoch {
            return;
        }
        let before = active.receipts.peer_watermark();
        active.receipts.apply_event(&event);
        let after = active.receipts.peer_watermark();
        if after != before {
            if let Some(at) = after {
                self.emit(SessionSignal::PeerWatermarkAdvanced(at));
            }
        }
    }

    // -- Pagination --

    /// Report the latest scroll geometry. Landing near the top triggers an
    /// older-page load when one isn't already running and history remains.
    pub async fn update_viewport(&self, metrics: ViewportMetrics) -> Option<PageLoad> {
        {
            let mut guard = self.inner.state.lock().await;
            let active = guard.as_mut()?;
            active.view.update(metrics);
            if !metrics.near_top(self.inner.config.top_threshold)
                || !active.paginator.should_load_older()
            {
                return None;
            }
        }
        self.load_older_page(metrics).await
    }

    /// Load one older page unconditionally (modulo an in-flight load). The
    /// anchor is captured from `metrics` before the prepend so the caller
    /// can restore the visual position after committing and re-measuring.
    pub async fn load_older_page(&self, metrics: ViewportMetrics) -> Option<PageLoad> {
        let (epoch, conversation_id, before, limit) = {
            let mut guard = self.inner.state.lock().await;
            let active = guard.as_mut()?;
            if !active.paginator.should_load_older() {
                return None;
            }
            let (before, limit) = active.paginator.begin();
            (active.epoch, active.conversation.id, before, limit)
        };
        let anchor = ScrollAnchor::capture(&metrics);

        let result = self
            .inner
            .backend
            .fetch_messages(conversation_id, before, limit)
            .await;

        let mut guard = self.inner.state.lock().await;
        let active = guard.as_mut()?;
        if active.epoch != epoch {
            debug!(epoch, "older page resolved after conversation switch; discarded");
            return None;
        }

        match result {
            Ok(rows) => {
                let returned = rows.len();
                let inserted = active.timeline.prepend_page(rows);
                active
                    .paginator
                    .complete(active.timeline.oldest_loaded_at(), returned);
                hydrate_urls(self.inner.backend.as_ref(), &mut active.timeline).await;
                trace!(returned, inserted, "older page merged");
                Some(PageLoad { inserted, anchor })
            }
            Err(e) => {
                // Not escalated: indicator off, retried on the next scroll
                // trigger.
                warn!(error = %e, "older page fetch failed");
                active.paginator.fail();
                None
            }
        }
    }

    // -- Sending --

    /// Run the optimistic send pipeline for a fresh draft.
    pub async fn send(&self, draft: Draft) -> Result<Message, SendError> {
        draft.validate()?;

        let (epoch, conversation_id, temp_id) = {
            let mut guard = self.inner.state.lock().await;
            let active = guard.as_mut().ok_or(SendError::NoConversation)?;
            if active.send_in_flight {
                return Err(SendError::SendInFlight);
            }
            active.send_in_flight = true;
            let provisional = optimistic_message(active.conversation.id, self.inner.self_id, &draft);
            let temp_id = active.timeline.append_optimistic(provisional);
            active.pending.insert(temp_id, PendingSend::new(&draft));
            (active.epoch, active.conversation.id, temp_id)
        };

        self.run_pipeline(epoch, conversation_id, temp_id).await
    }

    /// Re-run the pipeline for a Failed entry. Content is reused; an
    /// attachment that already uploaded is not uploaded again.
    pub async fn retry(&self, temp_id: MessageId) -> Result<Message, SendError> {
        let (epoch, conversation_id) = {
            let mut guard = self.inner.state.lock().await;
            let active = guard.as_mut().ok_or(SendError::NoConversation)?;
            if active.send_in_flight {
                return Err(SendError::SendInFlight);
            }
            if !active.pending.contains_key(&temp_id) || !active.timeline.begin_retry(&temp_id) {
                return Err(SendError::UnknownRetry(temp_id));
            }
            active.send_in_flight = true;
            (active.epoch, active.conversation.id)
        };

        self.run_pipeline(epoch, conversation_id, temp_id).await
    }

    /// Upload stage, then insert stage, then reconcile. Failure at either
    /// stage marks the entry Failed and surfaces the taxonomy error; an
    /// upload failure aborts before the insert so no row ever references an
    /// unresolved attachment.
    async fn run_pipeline(
        &self,
        epoch: u64,
        conversation_id: Uuid,
        temp_id: MessageId,
    ) -> Result<Message, SendError> {
        let (content, uploaded, upload) = {
            let mut guard = self.inner.state.lock().await;
            let active = current_mut(&mut guard, epoch).ok_or(SendError::StaleConversation)?;
            let pending = active
                .pending
                .get(&temp_id)
                .ok_or(SendError::UnknownRetry(temp_id))?;
            (
                pending.content.clone(),
                pending.uploaded.clone(),
                pending.upload.clone(),
            )
        };

        // Stage 1: attachment upload (skipped when already uploaded — a
        // retry after a pure persistence failure reuses the cached ref).
        let attachment = match (uploaded, upload) {
            (Some(att), _) => Some(att),
            (None, Some(payload)) => {
                match self.inner.backend.upload_attachment(payload).await {
                    Ok(att) => {
                        let mut guard = self.inner.state.lock().await;
                        let active = current_mut(&mut guard, epoch)
                            .ok_or(SendError::StaleConversation)?;
                        if let Some(pending) = active.pending.get_mut(&temp_id) {
                            pending.uploaded = Some(att.clone());
                            pending.upload = None;
                        }
                        // Swap the local preview for the durable ref.
                        active.timeline.set_attachment(&temp_id, att.clone());
                        Some(att)
                    }
                    Err(e) => {
                        self.fail_send(epoch, &temp_id).await;
                        return Err(SendError::Upload(e));
                    }
                }
            }
            (None, None) => None,
        };

        // Stage 2: durable row insert.
        let row = match self
            .inner
            .backend
            .insert_message(conversation_id, self.inner.self_id, &content, attachment)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                self.fail_send(epoch, &temp_id).await;
                return Err(SendError::Persistence(e));
            }
        };

        let mut guard = self.inner.state.lock().await;
        let Some(active) = current_mut(&mut guard, epoch) else {
            // Confirmed durable, but the user already switched away; the
            // row will come back through the next page load.
            return Err(SendError::StaleConversation);
        };
        active.timeline.reconcile(&temp_id, row.clone());
        active.pending.remove(&temp_id);
        active.send_in_flight = false;

        // Success-only side effects: sidebar bump, and a display URL for
        // media sent without one.
        if let Err(e) = self
            .inner
            .backend
            .touch_conversation(conversation_id, row.created_at)
            .await
        {
            warn!(error = %e, "conversation touch failed after send");
        }
        if row.attachment.as_ref().is_some_and(|a| a.url.is_none()) {
            hydrate_urls(self.inner.backend.as_ref(), &mut active.timeline).await;
        }

        Ok(row)
    }

    async fn fail_send(&self, epoch: u64, temp_id: &MessageId) {
        let mut guard = self.inner.state.lock().await;
        if let Some(active) = current_mut(&mut guard, epoch) {
            active.timeline.mark_failed(temp_id);
            active.send_in_flight = false;
        }
    }

    // -- Deletion --

    /// Soft-delete a durable message and hide it locally right away. The
    /// feed's Updated echo is an idempotent no-op afterwards.
    pub async fn delete_message(&self, id: Uuid) -> anyhow::Result<()> {
        self.inner.backend.soft_delete_message(id).await?;
        let mut guard = self.inner.state.lock().await;
        if let Some(active) = guard.as_mut() {
            active.timeline.mark_deleted(&MessageId::Durable(id));
        }
        Ok(())
    }

    // -- Read receipts --

    /// Publish "read up to now" for the local participant — only when the
    /// app is foregrounded and focused. Call on conversation open, tab
    /// refocus, and visibility regain; the feed pump calls it when a peer
    /// message lands in a focused view. Failures are logged, not surfaced.
    pub async fn publish_local_read(&self) {
        if !self.inner.focus.is_focused() {
            trace!("skipping read publish: not focused");
            return;
        }
        let mut guard = self.inner.state.lock().await;
        let Some(active) = guard.as_mut() else { return };
        publish_read(self.inner.backend.as_ref(), active, self.inner.self_id).await;
    }

    /// The user jumped to the newest messages (clicked the "new messages"
    /// badge): clear the counter and publish the read watermark.
    pub async fn jump_to_latest(&self) {
        {
            let mut guard = self.inner.state.lock().await;
            if let Some(active) = guard.as_mut() {
                active.view.caught_up();
            }
        }
        self.publish_local_read().await;
    }

    // -- Introspection --

    /// Snapshot everything the timeline view renders.
    pub async fn snapshot(&self) -> Option<TimelineSnapshot> {
        let guard = self.inner.state.lock().await;
        let active = guard.as_ref()?;
        Some(TimelineSnapshot {
            conversation_id: active.conversation.id,
            entries: active
                .timeline
                .entries()
                .iter()
                .map(|e| EntrySnapshot {
                    message: e.message.clone(),
                    state: e.state,
                    read_by_peer: active.receipts.is_read(&e.message),
                })
                .collect(),
            unread: active.view.unread(),
            has_more: active.paginator.has_more(),
            loading_older: active.paginator.is_loading(),
        })
    }
}

/// Epoch-checked access to the active conversation.
fn current_mut<'a>(guard: &'a mut Option<Active>, epoch: u64) -> Option<&'a mut Active> {
    guard.as_mut().filter(|active| active.epoch == epoch)
}

/// Resolve display URLs for every attachment still missing one, in a single
/// batch. Best-effort: a failure leaves the URLs unresolved and is logged.
async fn hydrate_urls(backend: &dyn ChatBackend, timeline: &mut Timeline) {
    let missing = timeline.attachments_missing_urls();
    if missing.is_empty() {
        return;
    }
    let refs: Vec<String> = missing.iter().map(|(_, r)| r.clone()).collect();
    match backend.resolve_attachment_urls(&refs).await {
        Ok(urls) => {
            for (id, storage_ref) in missing {
                if let Some(url) = urls.get(&storage_ref) {
                    timeline.set_attachment_url(&id, url.clone());
                }
            }
        }
        Err(e) => warn!(error = %e, "attachment URL resolution failed"),
    }
}

async fn publish_read(backend: &dyn ChatBackend, active: &mut Active, self_id: Uuid) {
    let now = Utc::now();
    match backend
        .set_read_watermark(active.conversation.id, self_id, now)
        .await
    {
        Ok(()) => active.receipts.advance_own(now),
        Err(e) => warn!(error = %e, "read watermark publish failed"),
    }
}

/// Drain the conversation's change feed into the session until the epoch
/// moves on or the feed closes. Redelivered events are no-ops thanks to the
/// timeline's upsert-by-id; a lagged receiver means a gap the next full
/// page load will repair (accepted limitation — no gap-filling here).
async fn pump_feed(
    session: ChatSession,
    epoch: u64,
    mut feed: broadcast::Receiver<FeedEvent>,
    mut epoch_rx: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            changed = epoch_rx.changed() => {
                if changed.is_err() || *epoch_rx.borrow() != epoch {
                    break;
                }
            }
            event = feed.recv() => match event {
                Ok(event) => {
                    session.apply_feed_event(epoch, event).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "feed receiver lagged; gap repairs on next page load");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    trace!(epoch, "feed pump exited");
}

async fn pump_watermarks(
    session: ChatSession,
    epoch: u64,
    mut feed: broadcast::Receiver<WatermarkEvent>,
    mut epoch_rx: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            changed = epoch_rx.changed() => {
                if changed.is_err() || *epoch_rx.borrow() != epoch {
                    break;
                }
            }
            event = feed.recv() => match event {
                Ok(event) => session.apply_watermark_event(epoch, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "watermark receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    trace!(epoch, "watermark pump exited");
}
