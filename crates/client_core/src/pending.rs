use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{LocalId, MessageId, UserId},
    protocol::Message,
};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::SyncError,
    types::{OperationOutcome, OperationPayload, OperationStatus, PendingOperation},
};

pub type OperationResult = Result<OperationOutcome, SyncError>;

const FINISHED_RESULTS_RETAINED: usize = 256;

struct TrackedOperation {
    operation: PendingOperation,
    result_tx: watch::Sender<Option<OperationResult>>,
    ack_message_id: Option<MessageId>,
    merged_as: Option<MessageId>,
    observed: bool,
}

#[derive(Default)]
struct PendingState {
    operations: HashMap<LocalId, TrackedOperation>,
    targets: HashMap<MessageId, LocalId>,
    finished: HashMap<LocalId, OperationResult>,
    finished_order: VecDeque<LocalId>,
}

/// A provisional send matched to its server echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMatch {
    pub local_id: LocalId,
    pub acknowledged: bool,
}

/// Tracks locally-initiated writes until the engine resolves them.
///
/// Any task may submit; only the session's engine task transitions status.
#[derive(Default)]
pub struct PendingOperationStore {
    inner: Mutex<PendingState>,
}

impl PendingOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an operation. Edits and recalls fail fast with
    /// `Conflict` while another one targets the same message.
    pub fn submit(&self, operation: PendingOperation) -> Result<LocalId, SyncError> {
        let mut state = self.state();
        if let Some(target_id) = operation.target_id() {
            if state.targets.contains_key(target_id) {
                return Err(SyncError::Conflict {
                    target_id: target_id.clone(),
                });
            }
            state
                .targets
                .insert(target_id.clone(), operation.local_id.clone());
        }

        let local_id = operation.local_id.clone();
        state.finished.remove(&local_id);
        let (result_tx, _) = watch::channel(None);
        state.operations.insert(
            local_id.clone(),
            TrackedOperation {
                operation,
                result_tx,
                ack_message_id: None,
                merged_as: None,
                observed: false,
            },
        );
        Ok(local_id)
    }

    pub fn get(&self, local_id: &LocalId) -> Option<PendingOperation> {
        self.state()
            .operations
            .get(local_id)
            .map(|tracked| tracked.operation.clone())
    }

    pub fn len(&self) -> usize {
        self.state().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn result_for(&self, local_id: &LocalId) -> Result<OperationWaiter, SyncError> {
        let state = self.state();
        if let Some(tracked) = state.operations.get(local_id) {
            return Ok(OperationWaiter::pending(tracked.result_tx.subscribe()));
        }
        state
            .finished
            .get(local_id)
            .cloned()
            .map(OperationWaiter::ready)
            .ok_or_else(|| SyncError::UnknownOperation(local_id.clone()))
    }

    /// Finds the in-flight send this server message confirms: first by the id
    /// the server acknowledged, then by fingerprint (sender, content, time
    /// window), oldest submission first.
    pub fn match_send(
        &self,
        message: &Message,
        self_user_id: Option<&UserId>,
        window: chrono::Duration,
    ) -> Option<SendMatch> {
        let mut state = self.state();

        let by_ack = state
            .operations
            .values()
            .find(|tracked| tracked.ack_message_id.as_ref() == Some(&message.id))
            .map(|tracked| tracked.operation.local_id.clone());

        let local_id = by_ack.or_else(|| {
            if self_user_id != Some(&message.sender_id) {
                return None;
            }
            state
                .operations
                .values()
                .filter(|tracked| tracked.merged_as.is_none() && tracked.ack_message_id.is_none())
                .filter(|tracked| {
                    let OperationPayload::Send { content, .. } = &tracked.operation.payload else {
                        return false;
                    };
                    let skew = message.send_time - tracked.operation.submitted_at;
                    *content == message.content && skew <= window && skew >= -window
                })
                .min_by_key(|tracked| tracked.operation.submitted_at)
                .map(|tracked| tracked.operation.local_id.clone())
        })?;

        let tracked = state.operations.get_mut(&local_id)?;
        if tracked.merged_as.is_some() {
            return None;
        }
        tracked.merged_as = Some(message.id.clone());
        debug!(
            local_id = %local_id,
            message_id = %message.id,
            "pending: matched send to server echo"
        );
        Some(SendMatch {
            acknowledged: tracked.operation.status == OperationStatus::Confirmed,
            local_id,
        })
    }

    /// Records the server acknowledgement of a send. Returns the id the echo
    /// was merged as, if the echo already arrived.
    pub fn record_send_ack(
        &self,
        local_id: &LocalId,
        message_id: Option<MessageId>,
    ) -> Option<MessageId> {
        let mut state = self.state();
        let tracked = state.operations.get_mut(local_id)?;
        tracked.operation.status = OperationStatus::Confirmed;
        if tracked.ack_message_id.is_none() {
            tracked.ack_message_id = message_id;
        }
        tracked.merged_as.clone()
    }

    /// Notes that the live feed already showed the effect of the in-flight
    /// edit or recall targeting `target_id`.
    pub fn mark_target_observed(&self, target_id: &MessageId) {
        let mut state = self.state();
        if let Some(local_id) = state.targets.get(target_id).cloned() {
            if let Some(tracked) = state.operations.get_mut(&local_id) {
                tracked.observed = true;
            }
        }
    }

    pub fn was_observed(&self, local_id: &LocalId) -> bool {
        self.state()
            .operations
            .get(local_id)
            .is_some_and(|tracked| tracked.observed)
    }

    /// Terminal transition: publishes the result to waiters and drops the
    /// operation.
    pub fn resolve(&self, local_id: &LocalId, result: OperationResult) -> Option<PendingOperation> {
        let mut state = self.state();
        let mut tracked = state.operations.remove(local_id)?;
        if let Some(target_id) = tracked.operation.target_id() {
            state.targets.remove(target_id);
        }
        tracked.operation.status = if result.is_ok() {
            OperationStatus::Confirmed
        } else {
            OperationStatus::Failed
        };
        tracked.result_tx.send_replace(Some(result.clone()));

        state.finished.insert(local_id.clone(), result);
        state.finished_order.push_back(local_id.clone());
        while state.finished_order.len() > FINISHED_RESULTS_RETAINED {
            if let Some(evicted) = state.finished_order.pop_front() {
                state.finished.remove(&evicted);
            }
        }
        Some(tracked.operation)
    }
}

/// Resolves once the engine has merged the operation's confirmation or failure.
pub struct OperationWaiter {
    inner: WaiterState,
}

enum WaiterState {
    Ready(OperationResult),
    Pending(watch::Receiver<Option<OperationResult>>),
}

impl OperationWaiter {
    fn ready(result: OperationResult) -> Self {
        Self {
            inner: WaiterState::Ready(result),
        }
    }

    fn pending(rx: watch::Receiver<Option<OperationResult>>) -> Self {
        Self {
            inner: WaiterState::Pending(rx),
        }
    }

    pub async fn wait(self) -> OperationResult {
        match self.inner {
            WaiterState::Ready(result) => result,
            WaiterState::Pending(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(value) => Option::clone(&value).unwrap_or(Err(SyncError::Closed)),
                Err(_) => Err(SyncError::Closed),
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
