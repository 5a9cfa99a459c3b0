//! Single-owner reconciliation of history pages, live events and local
//! writes into one ordered log.
//!
//! The engine is a synchronous state machine: every input returns a
//! [`Step`] carrying the diffs to publish and the I/O the session actor
//! must start. It never awaits, so every invariant holds between inputs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, LocalId, MessageId, MessageState, ReadPosition, UserId},
    protocol::{Message, MessageContent},
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    error::SyncError,
    log::OrderedLog,
    pending::PendingOperationStore,
    types::{
        Cursor, Delivery, DisconnectReason, EntryKey, LogDiff, LogEntry, OperationAck,
        OperationOutcome, OperationPayload, OperationStatus, PendingOperation, SessionNotice,
        SessionStatus, StreamEvent, SyncCursor,
    },
};

pub type LoadMoreReply = oneshot::Sender<Result<usize, SyncError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// First page of a freshly opened session.
    Initial,
    /// `loadMore()`: strictly older than the oldest loaded message.
    Older,
    /// Newest page replayed to close a gap in the live feed.
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub kind: PageKind,
    pub before: Option<Cursor>,
    pub count: u32,
}

#[derive(Debug)]
pub enum EngineInput {
    HistoryPage {
        request: HistoryRequest,
        result: Result<Vec<Message>, SyncError>,
    },
    Stream(StreamEvent),
    OperationResult {
        local_id: LocalId,
        result: Result<OperationAck, SyncError>,
    },
}

/// I/O requested by the engine, executed by the session actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchHistory(HistoryRequest),
    Submit(PendingOperation),
    AuthFailure(SyncError),
}

#[derive(Debug, Default)]
pub struct Step {
    pub diffs: Vec<LogDiff>,
    pub effects: Vec<Effect>,
}

impl Step {
    fn diff(&mut self, diff: LogDiff) {
        self.diffs.push(diff);
    }

    fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub page_size: u32,
    pub fingerprint_window: chrono::Duration,
}

pub struct ReconciliationEngine {
    chat_id: ChatId,
    self_user_id: Option<UserId>,
    settings: EngineSettings,
    log: OrderedLog,
    pending: Arc<PendingOperationStore>,
    cursor: Option<SyncCursor>,
    history_exhausted: bool,
    status: SessionStatus,
    gap_open: bool,
    feed_connected: bool,
    feed_exhausted: bool,
    history_in_flight: Option<PageKind>,
    refresh_queued: bool,
    older_queued: bool,
    load_more_waiters: Vec<LoadMoreReply>,
}

impl ReconciliationEngine {
    pub fn new(
        chat_id: ChatId,
        self_user_id: Option<UserId>,
        settings: EngineSettings,
        pending: Arc<PendingOperationStore>,
    ) -> Self {
        Self {
            chat_id,
            self_user_id,
            settings,
            log: OrderedLog::new(),
            pending,
            cursor: None,
            history_exhausted: false,
            status: SessionStatus::Connecting,
            gap_open: false,
            feed_connected: false,
            feed_exhausted: false,
            history_in_flight: None,
            refresh_queued: false,
            older_queued: false,
            load_more_waiters: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn cursor(&self) -> Option<&SyncCursor> {
        self.cursor.as_ref()
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.log.entries().to_vec()
    }

    pub fn entry(&self, key: &EntryKey) -> Option<&LogEntry> {
        self.log.get(key)
    }

    /// Error returned to writers while the session refuses writes.
    pub fn write_block(&self) -> Option<SyncError> {
        write_block(self.status)
    }

    pub fn start(&mut self) -> Step {
        let mut step = Step::default();
        self.dispatch(
            &mut step,
            HistoryRequest {
                kind: PageKind::Initial,
                before: None,
                count: self.settings.page_size,
            },
        );
        step
    }

    pub fn apply(&mut self, input: EngineInput) -> Step {
        let mut step = Step::default();
        if self.status == SessionStatus::Closed {
            return step;
        }
        match input {
            EngineInput::HistoryPage { request, result } => {
                self.on_history_page(request, result, &mut step)
            }
            EngineInput::Stream(event) => self.on_stream_event(event, &mut step),
            EngineInput::OperationResult { local_id, result } => {
                self.on_operation_result(local_id, result, &mut step)
            }
        }
        step
    }

    // ---- history ----

    fn dispatch(&mut self, step: &mut Step, request: HistoryRequest) {
        debug!(chat_id = %self.chat_id, kind = ?request.kind, "engine: fetching history page");
        self.history_in_flight = Some(request.kind);
        step.effect(Effect::FetchHistory(request));
    }

    fn request_refresh(&mut self, step: &mut Step) {
        if self.history_in_flight.is_some() {
            self.refresh_queued = true;
            return;
        }
        self.dispatch(
            step,
            HistoryRequest {
                kind: PageKind::Refresh,
                before: None,
                count: self.settings.page_size,
            },
        );
    }

    fn request_older(&mut self, step: &mut Step) {
        if self.history_in_flight.is_some() {
            self.older_queued = true;
            return;
        }
        self.dispatch(
            step,
            HistoryRequest {
                kind: PageKind::Older,
                before: self.cursor.as_ref().map(|cursor| cursor.before.clone()),
                count: self.settings.page_size,
            },
        );
    }

    fn dispatch_queued(&mut self, step: &mut Step) {
        if self.refresh_queued {
            self.refresh_queued = false;
            self.request_refresh(step);
        } else if self.older_queued {
            self.older_queued = false;
            if self.history_exhausted {
                for waiter in self.load_more_waiters.drain(..) {
                    let _ = waiter.send(Ok(0));
                }
            } else {
                self.request_older(step);
            }
        }
    }

    /// Concurrent calls share one in-flight request and all receive its result.
    pub fn load_more(&mut self, reply: LoadMoreReply) -> Step {
        let mut step = Step::default();
        if let Some(err) = self.write_block() {
            let _ = reply.send(Err(err));
            return step;
        }
        if self.history_exhausted {
            let _ = reply.send(Ok(0));
            return step;
        }
        let coalesced = self.history_in_flight == Some(PageKind::Older) || self.older_queued;
        self.load_more_waiters.push(reply);
        if !coalesced {
            self.request_older(&mut step);
        }
        step
    }

    /// Refetches the newest page on demand. Allowed while degraded so a
    /// session whose history fetch failed can recover without a reconnect.
    pub fn refresh(&mut self) -> Result<Step, SyncError> {
        match self.status {
            SessionStatus::Closed => return Err(SyncError::Closed),
            SessionStatus::AuthRequired => {
                return Err(SyncError::Auth("re-authentication required".into()))
            }
            _ => {}
        }
        let mut step = Step::default();
        self.request_refresh(&mut step);
        Ok(step)
    }

    fn on_history_page(
        &mut self,
        request: HistoryRequest,
        result: Result<Vec<Message>, SyncError>,
        step: &mut Step,
    ) {
        self.history_in_flight = None;
        match result {
            Ok(page) => {
                let fetched = page.len();
                let oldest = page
                    .iter()
                    .min_by(|a, b| (a.send_time, &a.id).cmp(&(b.send_time, &b.id)))
                    .map(|message| (message.id.clone(), message.send_time));

                let mut merged = 0;
                for message in page.into_iter().rev() {
                    if message.chat_id != self.chat_id {
                        warn!(chat_id = %self.chat_id, message_id = %message.id, "engine: dropping message from another chat");
                        continue;
                    }
                    if self.merge_message(message, step) {
                        merged += 1;
                    }
                }

                if let Some((id, time)) = oldest {
                    self.advance_cursor(id, time);
                }
                if request.kind != PageKind::Refresh && fetched < request.count as usize {
                    self.history_exhausted = true;
                }
                debug!(
                    chat_id = %self.chat_id,
                    kind = ?request.kind,
                    fetched,
                    merged,
                    "engine: merged history page"
                );
                if request.kind == PageKind::Older {
                    for waiter in self.load_more_waiters.drain(..) {
                        let _ = waiter.send(Ok(merged));
                    }
                } else {
                    self.on_newest_page_loaded(step);
                }
            }
            Err(err) => {
                warn!(chat_id = %self.chat_id, kind = ?request.kind, "engine: history fetch failed: {err}");
                if request.kind == PageKind::Older {
                    for waiter in self.load_more_waiters.drain(..) {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
                if err.is_auth() {
                    self.require_auth(err, step);
                } else {
                    if request.kind != PageKind::Older {
                        // Still behind the newest page; refetch on the next connect.
                        self.gap_open = true;
                    }
                    // Only transport errors that outlived the retries degrade the
                    // session; a rejected page is reported to its callers alone.
                    if err.is_retriable() {
                        self.set_status(SessionStatus::Degraded, step);
                    }
                }
            }
        }
        if self.write_block().is_some() {
            self.refresh_queued = false;
            self.older_queued = false;
            for waiter in self.load_more_waiters.drain(..) {
                let _ = waiter.send(Err(SyncError::Degraded));
            }
            return;
        }
        self.dispatch_queued(step);
    }

    /// The log caught up with the server. Lifts `Degraded` unless the live
    /// feed itself gave up.
    fn on_newest_page_loaded(&mut self, step: &mut Step) {
        if self.feed_connected {
            self.gap_open = false;
        }
        if self.status == SessionStatus::Degraded && !self.feed_exhausted {
            let status = if self.feed_connected {
                SessionStatus::Live
            } else {
                SessionStatus::Reconnecting
            };
            info!(chat_id = %self.chat_id, ?status, "engine: history recovered");
            self.set_status(status, step);
        }
    }

    fn advance_cursor(&mut self, id: MessageId, time: DateTime<Utc>) {
        let older = match &self.cursor {
            None => true,
            Some(cursor) => (time, &id) < (cursor.oldest_time, &cursor.before.0),
        };
        if older {
            self.cursor = Some(SyncCursor {
                before: Cursor(id),
                oldest_time: time,
            });
        }
    }

    // ---- live feed ----

    fn on_stream_event(&mut self, event: StreamEvent, step: &mut Step) {
        match event {
            StreamEvent::NewMessage(message) => {
                if message.chat_id == self.chat_id {
                    self.merge_message(message, step);
                }
            }
            StreamEvent::Edited {
                id,
                content,
                version,
            } => {
                self.pending.mark_target_observed(&id);
                self.apply_edit(&id, content, version, step);
            }
            StreamEvent::Recalled(id) => {
                self.pending.mark_target_observed(&id);
                self.apply_recall(&id, step);
            }
            StreamEvent::Chunk { id, delta } => self.apply_chunk(&id, &delta, step),
            StreamEvent::Connected => {
                info!(chat_id = %self.chat_id, gap = self.gap_open, "engine: live feed connected");
                self.feed_connected = true;
                self.feed_exhausted = false;
                self.set_status(SessionStatus::Live, step);
                if self.gap_open {
                    self.gap_open = false;
                    self.request_refresh(step);
                }
            }
            StreamEvent::Disconnected(reason) => {
                info!(chat_id = %self.chat_id, ?reason, "engine: live feed disconnected");
                self.gap_open = true;
                self.feed_connected = false;
                match reason {
                    DisconnectReason::RetriesExhausted => {
                        self.feed_exhausted = true;
                        self.set_status(SessionStatus::Degraded, step)
                    }
                    DisconnectReason::Unauthorized(reason) => {
                        self.require_auth(SyncError::Auth(reason), step)
                    }
                    DisconnectReason::Closed | DisconnectReason::Transport(_) => {
                        if !self.status.blocks_writes() {
                            self.set_status(SessionStatus::Reconnecting, step);
                        }
                    }
                }
            }
        }
    }

    /// Merges one server message. Returns whether the log changed.
    fn merge_message(&mut self, message: Message, step: &mut Step) -> bool {
        let key = EntryKey::Server(message.id.clone());
        if self.log.contains(&key) {
            return self.merge_existing(message, step);
        }

        if let Some(matched) =
            self.pending
                .match_send(&message, self.self_user_id.as_ref(), self.settings.fingerprint_window)
        {
            let message_id = message.id.clone();
            let local_key = EntryKey::Local(matched.local_id.clone());
            let entry = LogEntry::confirmed(message);
            let had_provisional = self.log.remove(&local_key).is_some();
            if let Some(index) = self.log.insert(entry.clone()) {
                if had_provisional {
                    step.diff(LogDiff::Replace {
                        previous: local_key,
                        index,
                        entry,
                    });
                } else {
                    step.diff(LogDiff::Insert { index, entry });
                }
            }
            if matched.acknowledged {
                self.pending.resolve(
                    &matched.local_id,
                    Ok(OperationOutcome::Sent { message_id }),
                );
            }
            return true;
        }

        let entry = LogEntry::confirmed(message);
        match self.log.insert(entry.clone()) {
            Some(index) => {
                step.diff(LogDiff::Insert { index, entry });
                true
            }
            None => false,
        }
    }

    /// Redelivery of a known id: only a newer version or a recall changes it.
    fn merge_existing(&mut self, message: Message, step: &mut Step) -> bool {
        let mut changed = false;
        if message.edited_version > 0 {
            changed |= self.apply_edit(&message.id, message.content, message.edited_version, step);
        }
        if message.state.is_recalled() {
            changed |= self.apply_recall(&message.id, step);
        }
        changed
    }

    fn apply_edit(
        &mut self,
        id: &MessageId,
        content: MessageContent,
        version: u64,
        step: &mut Step,
    ) -> bool {
        let key = EntryKey::Server(id.clone());
        let Some(current) = self.log.get(&key) else {
            debug!(chat_id = %self.chat_id, message_id = %id, "engine: edit for unloaded message ignored");
            return false;
        };
        if current.message.state.is_recalled() || version <= current.message.edited_version {
            return false;
        }
        let Some(index) = self.log.update(&key, |entry| {
            entry.message.content = content;
            entry.message.edited_version = version;
            entry.message.state = MessageState::Edited;
        }) else {
            return false;
        };
        let entry = self.log.entries()[index].clone();
        step.diff(LogDiff::Replace {
            previous: key,
            index,
            entry,
        });
        true
    }

    fn apply_recall(&mut self, id: &MessageId, step: &mut Step) -> bool {
        let key = EntryKey::Server(id.clone());
        match self.log.get(&key) {
            Some(entry) if !entry.message.state.is_recalled() => {}
            _ => return false,
        }
        let Some(index) = self.log.update(&key, |entry| {
            entry.message.state = MessageState::Recalled;
        }) else {
            return false;
        };
        step.diff(LogDiff::MarkState {
            key,
            index,
            state: MessageState::Recalled,
        });
        true
    }

    fn apply_chunk(&mut self, id: &MessageId, delta: &str, step: &mut Step) {
        let key = EntryKey::Server(id.clone());
        match self.log.get(&key) {
            Some(entry) if !entry.message.state.is_recalled() => {}
            _ => return,
        }
        let mut appended = false;
        let Some(index) = self.log.update(&key, |entry| {
            appended = entry.message.content.append_text(delta);
        }) else {
            return;
        };
        if appended {
            let entry = self.log.entries()[index].clone();
            step.diff(LogDiff::Replace {
                previous: key,
                index,
                entry,
            });
        }
    }

    // ---- local writes ----

    /// Called once the operation is registered in the pending store.
    pub fn submit(&mut self, operation: PendingOperation) -> Step {
        let mut step = Step::default();
        match &operation.payload {
            OperationPayload::Send { content, quote_id } => {
                let entry = self.provisional_entry(&operation, content.clone(), quote_id.clone());
                if let Some(index) = self.log.insert(entry.clone()) {
                    step.diff(LogDiff::Insert { index, entry });
                }
            }
            OperationPayload::Edit { target_id, .. } | OperationPayload::Recall { target_id } => {
                let recalled = self
                    .log
                    .get(&EntryKey::Server(target_id.clone()))
                    .is_some_and(|entry| entry.message.state.is_recalled());
                if recalled {
                    let target_id = target_id.clone();
                    self.resolve_stale(&operation.local_id, target_id, &mut step);
                    return step;
                }
            }
        }
        step.effect(Effect::Submit(operation));
        step
    }

    fn provisional_entry(
        &self,
        operation: &PendingOperation,
        content: MessageContent,
        quote_id: Option<MessageId>,
    ) -> LogEntry {
        LogEntry {
            key: EntryKey::Local(operation.local_id.clone()),
            message: Message {
                id: MessageId::new(format!("local:{}", operation.local_id)),
                chat_id: self.chat_id.clone(),
                sender_id: self.self_user_id.clone().unwrap_or_else(|| UserId::new("")),
                send_time: operation.submitted_at,
                content,
                quote_id,
                edited_version: 0,
                state: MessageState::Active,
            },
            delivery: Delivery::Pending,
        }
    }

    fn on_operation_result(
        &mut self,
        local_id: LocalId,
        result: Result<OperationAck, SyncError>,
        step: &mut Step,
    ) {
        let Some(operation) = self.pending.get(&local_id) else {
            debug!(chat_id = %self.chat_id, local_id = %local_id, "engine: result for unknown operation");
            return;
        };

        match (operation.payload, result) {
            (OperationPayload::Send { .. }, Ok(OperationAck::Sent { message_id })) => {
                self.on_send_ack(&local_id, message_id, step)
            }
            (OperationPayload::Send { .. }, Err(err)) => {
                let key = EntryKey::Local(local_id.clone());
                if let Some(index) = self.log.update(&key, |entry| entry.delivery = Delivery::Failed) {
                    step.diff(LogDiff::Delivery {
                        key,
                        index,
                        delivery: Delivery::Failed,
                    });
                }
                self.fail_operation(&local_id, None, err, step);
            }
            (OperationPayload::Edit { target_id, content }, Ok(OperationAck::Edited { edited_version })) => {
                let key = EntryKey::Server(target_id.clone());
                let observed = self.pending.was_observed(&local_id);
                let current = match self.log.get(&key) {
                    Some(entry) if !entry.message.state.is_recalled() => entry.message.edited_version,
                    _ => {
                        self.resolve_stale(&local_id, target_id, step);
                        return;
                    }
                };
                let version = edited_version.unwrap_or(if observed { current } else { current + 1 });
                self.apply_edit(&target_id, content, version, step);
                let version = self
                    .log
                    .get(&key)
                    .map_or(version, |entry| entry.message.edited_version);
                self.pending.resolve(
                    &local_id,
                    Ok(OperationOutcome::Edited {
                        message_id: target_id,
                        version,
                    }),
                );
            }
            (OperationPayload::Recall { target_id }, Ok(OperationAck::Recalled)) => {
                let observed = self.pending.was_observed(&local_id);
                let already_recalled = match self.log.get(&EntryKey::Server(target_id.clone())) {
                    Some(entry) => entry.message.state.is_recalled(),
                    None => {
                        self.resolve_stale(&local_id, target_id, step);
                        return;
                    }
                };
                if already_recalled && !observed {
                    self.resolve_stale(&local_id, target_id, step);
                    return;
                }
                self.apply_recall(&target_id, step);
                self.pending.resolve(
                    &local_id,
                    Ok(OperationOutcome::Recalled {
                        message_id: target_id,
                    }),
                );
            }
            (OperationPayload::Edit { target_id, .. } | OperationPayload::Recall { target_id }, Err(err)) => {
                self.fail_operation(&local_id, Some(target_id), err, step);
            }
            (_, Ok(ack)) => {
                warn!(chat_id = %self.chat_id, local_id = %local_id, ?ack, "engine: acknowledgement does not match operation");
                self.fail_operation(
                    &local_id,
                    None,
                    SyncError::Protocol(format!("unexpected acknowledgement {ack:?}")),
                    step,
                );
            }
        }
    }

    fn on_send_ack(&mut self, local_id: &LocalId, message_id: Option<MessageId>, step: &mut Step) {
        if let Some(merged_as) = self.pending.record_send_ack(local_id, message_id.clone()) {
            self.pending.resolve(
                local_id,
                Ok(OperationOutcome::Sent {
                    message_id: merged_as,
                }),
            );
            return;
        }

        // The echo may have been merged before the ack, under a fingerprint
        // that no longer matched (e.g. server-side normalisation).
        if let Some(message_id) = message_id {
            if self.log.contains(&EntryKey::Server(message_id.clone())) {
                let key = EntryKey::Local(local_id.clone());
                if let Some((index, _)) = self.log.remove(&key) {
                    step.diff(LogDiff::Remove { key, index });
                }
                self.pending
                    .resolve(local_id, Ok(OperationOutcome::Sent { message_id }));
                return;
            }
        }

        // The echo has not been merged yet; the newest page carries it even if
        // the live feed never does.
        self.request_refresh(step);
    }

    fn resolve_stale(&mut self, local_id: &LocalId, target_id: MessageId, step: &mut Step) {
        info!(chat_id = %self.chat_id, local_id = %local_id, target_id = %target_id, "engine: operation already handled");
        self.pending.resolve(
            local_id,
            Err(SyncError::StaleOperation {
                target_id: target_id.clone(),
            }),
        );
        step.diff(LogDiff::Notice(SessionNotice::AlreadyHandled {
            local_id: local_id.clone(),
            target_id,
        }));
    }

    fn fail_operation(
        &mut self,
        local_id: &LocalId,
        target_id: Option<MessageId>,
        err: SyncError,
        step: &mut Step,
    ) {
        warn!(chat_id = %self.chat_id, local_id = %local_id, "engine: operation failed: {err}");
        self.pending.resolve(local_id, Err(err.clone()));
        let notice = match (&err, target_id) {
            (SyncError::Conflict { .. } | SyncError::StaleOperation { .. }, Some(target_id)) => {
                SessionNotice::AlreadyHandled {
                    local_id: local_id.clone(),
                    target_id,
                }
            }
            _ => SessionNotice::OperationFailed {
                local_id: local_id.clone(),
                reason: err.to_string(),
            },
        };
        step.diff(LogDiff::Notice(notice));
        if err.is_auth() {
            self.require_auth(err, step);
        }
    }

    /// Resubmits a failed provisional send under the same local id. The
    /// entry moves to the submission time of the retry.
    pub fn retry_send(&mut self, local_id: &LocalId) -> Result<Step, SyncError> {
        if let Some(err) = self.write_block() {
            return Err(err);
        }
        let key = EntryKey::Local(local_id.clone());
        let failed = match self.log.get(&key) {
            Some(entry) if entry.delivery == Delivery::Failed => entry.message.clone(),
            _ => return Err(SyncError::UnknownOperation(local_id.clone())),
        };
        let operation = PendingOperation {
            local_id: local_id.clone(),
            chat_id: self.chat_id.clone(),
            payload: OperationPayload::Send {
                content: failed.content.clone(),
                quote_id: failed.quote_id.clone(),
            },
            submitted_at: Utc::now(),
            status: OperationStatus::InFlight,
        };
        self.pending.submit(operation.clone())?;

        let mut step = Step::default();
        if let Some((index, _)) = self.log.remove(&key) {
            step.diff(LogDiff::Remove { key, index });
        }
        let entry = self.provisional_entry(&operation, failed.content, failed.quote_id);
        if let Some(index) = self.log.insert(entry.clone()) {
            step.diff(LogDiff::Insert { index, entry });
        }
        step.effect(Effect::Submit(operation));
        Ok(step)
    }

    pub fn discard_failed(&mut self, local_id: &LocalId) -> Result<Step, SyncError> {
        let key = EntryKey::Local(local_id.clone());
        match self.log.get(&key) {
            Some(entry) if entry.delivery == Delivery::Failed => {}
            _ => return Err(SyncError::UnknownOperation(local_id.clone())),
        }
        let mut step = Step::default();
        if let Some((index, _)) = self.log.remove(&key) {
            step.diff(LogDiff::Remove { key, index });
        }
        Ok(step)
    }

    /// Read marker for a confirmed message in the log.
    pub fn read_position_for(&self, message_id: &MessageId) -> Result<ReadPosition, SyncError> {
        let entry = self
            .log
            .get(&EntryKey::Server(message_id.clone()))
            .ok_or_else(|| SyncError::NotFound(message_id.clone()))?;
        Ok(ReadPosition {
            chat_id: self.chat_id.clone(),
            last_read_message_id: message_id.clone(),
            last_read_time: entry.message.send_time,
        })
    }

    /// Marker for the newest confirmed entry.
    pub fn latest_read_position(&self) -> Option<ReadPosition> {
        let entry = self
            .log
            .entries()
            .iter()
            .rev()
            .find(|entry| !entry.is_provisional())?;
        Some(ReadPosition {
            chat_id: self.chat_id.clone(),
            last_read_message_id: entry.message.id.clone(),
            last_read_time: entry.message.send_time,
        })
    }

    pub fn unread_count(&self, marker: Option<&ReadPosition>) -> Option<usize> {
        let marker = marker?;
        let marker_key = EntryKey::Server(marker.last_read_message_id.clone());
        let count = self
            .log
            .entries()
            .iter()
            .filter(|entry| !entry.is_provisional())
            .filter(|entry| self.self_user_id.as_ref() != Some(&entry.message.sender_id))
            .filter(|entry| entry.order_key() > (marker.last_read_time, &marker_key))
            .count();
        Some(count)
    }

    pub fn close(&mut self) -> Step {
        let mut step = Step::default();
        for waiter in self.load_more_waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::Closed));
        }
        self.refresh_queued = false;
        self.older_queued = false;
        self.set_status(SessionStatus::Closed, &mut step);
        step
    }

    fn require_auth(&mut self, err: SyncError, step: &mut Step) {
        if self.status != SessionStatus::AuthRequired {
            error!(chat_id = %self.chat_id, "engine: authentication rejected: {err}");
            step.effect(Effect::AuthFailure(err));
        }
        self.set_status(SessionStatus::AuthRequired, step);
    }

    fn set_status(&mut self, status: SessionStatus, step: &mut Step) {
        if self.status != status {
            self.status = status;
            step.diff(LogDiff::Status(status));
        }
    }
}

pub(crate) fn write_block(status: SessionStatus) -> Option<SyncError> {
    match status {
        SessionStatus::Degraded => Some(SyncError::Degraded),
        SessionStatus::AuthRequired => Some(SyncError::Auth("re-authentication required".into())),
        SessionStatus::Closed => Some(SyncError::Closed),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
