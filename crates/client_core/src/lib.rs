//! Per-chat message synchronization: history pages, the live push feed and
//! local optimistic writes reconciled into one ordered, deduplicated log.

use async_trait::async_trait;
use shared::{
    domain::{ChatId, UserId},
    protocol::Message,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod log;
pub mod pending;
pub mod read_position;
pub mod retry;
pub mod session;
pub mod types;
pub mod ws;

pub use config::{load_config, SyncConfig};
pub use error::SyncError;
pub use http::HttpChatApi;
pub use pending::{OperationWaiter, PendingOperationStore};
pub use read_position::{InMemoryReadPositions, ReadPositionPersistence, ReadPositionTracker};
pub use session::{ChatSession, SyncClient, SyncServices};
pub use types::*;
pub use ws::WsLiveStream;

/// Paginated history. Pages come back newest first.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        before: Option<Cursor>,
        count: u32,
    ) -> Result<Vec<Message>, SyncError>;
}

/// Push channel for one chat.
#[async_trait]
pub trait LiveStream: Send + Sync {
    async fn subscribe(&self, chat_id: &ChatId) -> Result<LiveSubscription, SyncError>;
}

/// Write side: send, edit and recall. Never retried automatically.
#[async_trait]
pub trait OperationSink: Send + Sync {
    async fn submit(&self, operation: &PendingOperation) -> Result<OperationAck, SyncError>;
}

/// Read-only view of the credentials owned elsewhere.
pub trait AuthProvider: Send + Sync {
    fn current_token(&self) -> Option<String>;

    fn current_user_id(&self) -> Option<UserId>;

    /// Called once per transition into `AuthRequired`.
    fn on_auth_failure(&self, _err: &SyncError) {}
}

#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    pub token: Option<String>,
    pub user_id: Option<UserId>,
}

impl StaticAuth {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            user_id: Some(UserId::new(user_id)),
        }
    }
}

impl AuthProvider for StaticAuth {
    fn current_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.user_id.clone()
    }
}

/// Handle on a live subscription. Dropping it stops the producer.
pub struct LiveSubscription {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<StreamEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Subscription fed by an external producer.
    pub fn from_receiver(events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { events, task: None }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
