use shared::domain::{LocalId, MessageId};
use thiserror::Error;

/// Error taxonomy shared by every fallible operation of a chat session.
///
/// `Clone` so one operation result can be delivered to several waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("another edit or recall of message {target_id} is already in flight")]
    Conflict { target_id: MessageId },
    #[error("message {target_id} no longer accepts this operation")]
    StaleOperation { target_id: MessageId },
    #[error("session is degraded; waiting for the live feed to reconnect")]
    Degraded,
    #[error("session is closed")]
    Closed,
    #[error("unknown operation {0}")]
    UnknownOperation(LocalId),
    #[error("message {0} is not in the log")]
    NotFound(MessageId),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SyncError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                SyncError::Auth(err.to_string())
            }
            Some(status) if status.is_client_error() => SyncError::Protocol(err.to_string()),
            _ if err.is_decode() => SyncError::Protocol(err.to_string()),
            _ => SyncError::Network(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Persistence(format!("{err:#}"))
    }
}
