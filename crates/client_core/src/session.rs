use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use shared::{
    domain::{ChatId, LocalId, MessageId, ReadPosition},
    protocol::MessageContent,
};
use storage::Storage;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use crate::{
    config::{normalize_database_url, SyncConfig},
    engine::{self, EngineInput, EngineSettings, HistoryRequest, LoadMoreReply, ReconciliationEngine, Step},
    error::SyncError,
    http::HttpChatApi,
    pending::{OperationWaiter, PendingOperationStore},
    read_position::{ReadPositionPersistence, ReadPositionTracker},
    retry::{retry_transient, Backoff},
    types::{LogDiff, LogEntry, OperationPayload, PendingOperation, SessionStatus},
    ws::WsLiveStream,
    AuthProvider, HistoryFetcher, LiveStream, LiveSubscription, OperationSink,
};

/// The collaborators a session talks to.
#[derive(Clone)]
pub struct SyncServices {
    pub history: Arc<dyn HistoryFetcher>,
    pub stream: Arc<dyn LiveStream>,
    pub sink: Arc<dyn OperationSink>,
    pub auth: Arc<dyn AuthProvider>,
    pub read_positions: Arc<dyn ReadPositionPersistence>,
}

impl SyncServices {
    /// HTTP + WebSocket adapters against `config.server_url`, read positions
    /// in the configured SQLite database.
    pub async fn connect(config: &SyncConfig, auth: Arc<dyn AuthProvider>) -> anyhow::Result<Self> {
        let database_url = normalize_database_url(&config.database_url);
        let storage = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open read position store at {database_url}"))?;
        let api = Arc::new(HttpChatApi::new(config.server_url.clone(), Arc::clone(&auth)));
        let stream = Arc::new(WsLiveStream::new(
            config.server_url.clone(),
            Arc::clone(&auth),
            config.reconnect_backoff(),
        ));
        Ok(Self {
            history: api.clone(),
            stream,
            sink: api,
            auth,
            read_positions: Arc::new(storage),
        })
    }
}

pub struct SyncClient {
    services: SyncServices,
    config: SyncConfig,
}

impl SyncClient {
    pub fn new(services: SyncServices, config: SyncConfig) -> Self {
        Self { services, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts the initial history fetch and the live subscription. Every call
    /// starts from an empty log.
    pub async fn open(&self, chat_id: ChatId) -> Result<ChatSession, SyncError> {
        info!(chat_id = %chat_id, "session: opening");
        let mut read_positions = ReadPositionTracker::new(Arc::clone(&self.services.read_positions));
        if let Err(err) = read_positions.load(&chat_id).await {
            warn!(chat_id = %chat_id, "session: could not load read position: {err}");
        }
        let subscription = self.services.stream.subscribe(&chat_id).await?;

        let pending = Arc::new(PendingOperationStore::new());
        let engine = ReconciliationEngine::new(
            chat_id.clone(),
            self.services.auth.current_user_id(),
            EngineSettings {
                page_size: self.config.page_size,
                fingerprint_window: self.config.fingerprint_window(),
            },
            Arc::clone(&pending),
        );

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (diff_tx, diff_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);

        let stream_task = tokio::spawn(forward_stream(subscription, inbox_tx.clone()));
        let actor = SessionActor {
            chat_id: chat_id.clone(),
            engine,
            services: self.services.clone(),
            backoff: self.config.transport_backoff(),
            inbox: inbox_tx.clone(),
            diffs: Some(diff_tx),
            status: status_tx,
            read_positions,
            stream_task: Some(stream_task),
            history_task: None,
        };
        let actor_task = tokio::spawn(actor.run(inbox_rx));

        Ok(ChatSession {
            chat_id,
            inbox: inbox_tx,
            pending,
            status: status_rx,
            diffs: Mutex::new(Some(diff_rx)),
            actor: Mutex::new(Some(actor_task)),
        })
    }
}

enum Command {
    Input(EngineInput),
    Submit(PendingOperation),
    LoadMore(LoadMoreReply),
    Refresh(oneshot::Sender<Result<(), SyncError>>),
    RetrySend {
        local_id: LocalId,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    DiscardFailed {
        local_id: LocalId,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    MarkRead {
        message_id: Option<MessageId>,
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
    ReadPosition(oneshot::Sender<Option<ReadPosition>>),
    UnreadCount(oneshot::Sender<Option<usize>>),
    Snapshot(oneshot::Sender<Vec<LogEntry>>),
    Close(Option<oneshot::Sender<Result<(), SyncError>>>),
}

/// One open conversation. Mutations are queued to the session's engine
/// task; diffs come back in the order they were applied.
pub struct ChatSession {
    chat_id: ChatId,
    inbox: mpsc::UnboundedSender<Command>,
    pending: Arc<PendingOperationStore>,
    status: watch::Receiver<SessionStatus>,
    diffs: Mutex<Option<mpsc::UnboundedReceiver<LogDiff>>>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// The diff sequence for this session. Available once; it ends when the
    /// session closes.
    pub fn observe_log(&self) -> Option<UnboundedReceiverStream<LogDiff>> {
        self.diffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(UnboundedReceiverStream::new)
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn send(&self, content: MessageContent) -> Result<LocalId, SyncError> {
        self.submit(OperationPayload::Send {
            content,
            quote_id: None,
        })
    }

    pub fn send_quoted(&self, content: MessageContent, quote_id: MessageId) -> Result<LocalId, SyncError> {
        self.submit(OperationPayload::Send {
            content,
            quote_id: Some(quote_id),
        })
    }

    pub fn edit(&self, target_id: MessageId, content: MessageContent) -> Result<LocalId, SyncError> {
        self.submit(OperationPayload::Edit { target_id, content })
    }

    pub fn recall(&self, target_id: MessageId) -> Result<LocalId, SyncError> {
        self.submit(OperationPayload::Recall { target_id })
    }

    fn submit(&self, payload: OperationPayload) -> Result<LocalId, SyncError> {
        if let Some(err) = engine::write_block(*self.status.borrow()) {
            return Err(err);
        }
        let operation = PendingOperation::new(self.chat_id.clone(), payload);
        let local_id = self.pending.submit(operation.clone())?;
        if self.inbox.send(Command::Submit(operation)).is_err() {
            self.pending.resolve(&local_id, Err(SyncError::Closed));
            return Err(SyncError::Closed);
        }
        Ok(local_id)
    }

    /// Resolves once the engine has merged the operation's confirmation or failure.
    pub fn result_for(&self, local_id: &LocalId) -> Result<OperationWaiter, SyncError> {
        self.pending.result_for(local_id)
    }

    pub async fn retry_send(&self, local_id: LocalId) -> Result<(), SyncError> {
        self.request(|reply| Command::RetrySend { local_id, reply })
            .await?
    }

    pub async fn discard_failed(&self, local_id: LocalId) -> Result<(), SyncError> {
        self.request(|reply| Command::DiscardFailed { local_id, reply })
            .await?
    }

    /// Fetches the page before the oldest loaded message. Returns how many
    /// entries were merged.
    pub async fn load_more(&self) -> Result<usize, SyncError> {
        self.request(Command::LoadMore).await?
    }

    /// Refetches the newest page. This is the way out of `Degraded` while the
    /// live feed stays connected.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.request(Command::Refresh).await?
    }

    /// Moves the read marker to `message_id`. Returns `false` if that would
    /// move it backward.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<bool, SyncError> {
        self.request(|reply| Command::MarkRead {
            message_id: Some(message_id),
            reply,
        })
        .await?
    }

    /// Marks the newest confirmed message as read.
    pub async fn mark_all_read(&self) -> Result<bool, SyncError> {
        self.request(|reply| Command::MarkRead {
            message_id: None,
            reply,
        })
        .await?
    }

    pub async fn read_position(&self) -> Result<Option<ReadPosition>, SyncError> {
        self.request(Command::ReadPosition).await
    }

    pub async fn unread_count(&self) -> Result<Option<usize>, SyncError> {
        self.request(Command::UnreadCount).await
    }

    pub async fn snapshot(&self) -> Result<Vec<LogEntry>, SyncError> {
        self.request(Command::Snapshot).await
    }

    /// Persists the read position and stops the live subscription. In-flight
    /// writes keep running but their results are no longer merged.
    pub async fn close(&self) -> Result<(), SyncError> {
        let (reply, result) = oneshot::channel();
        if self.inbox.send(Command::Close(Some(reply))).is_err() {
            return Ok(());
        }
        let outcome = result.await.unwrap_or(Ok(()));
        let actor = self.actor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(actor) = actor {
            let _ = actor.await;
        }
        outcome
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (reply, result) = oneshot::channel();
        self.inbox
            .send(command(reply))
            .map_err(|_| SyncError::Closed)?;
        result.await.map_err(|_| SyncError::Closed)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let _ = self.inbox.send(Command::Close(None));
    }
}

async fn forward_stream(mut subscription: LiveSubscription, inbox: mpsc::UnboundedSender<Command>) {
    while let Some(event) = subscription.next().await {
        if inbox.send(Command::Input(EngineInput::Stream(event))).is_err() {
            return;
        }
    }
}

struct SessionActor {
    chat_id: ChatId,
    engine: ReconciliationEngine,
    services: SyncServices,
    backoff: Backoff,
    inbox: mpsc::UnboundedSender<Command>,
    diffs: Option<mpsc::UnboundedSender<LogDiff>>,
    status: watch::Sender<SessionStatus>,
    read_positions: ReadPositionTracker<dyn ReadPositionPersistence>,
    stream_task: Option<JoinHandle<()>>,
    history_task: Option<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        let step = self.engine.start();
        self.publish(step);

        while let Some(command) = inbox.recv().await {
            match command {
                Command::Close(reply) => {
                    let outcome = self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                    break;
                }
                command => self.handle(command),
            }
        }
        info!(chat_id = %self.chat_id, "session: closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Input(input) => {
                let step = self.engine.apply(input);
                self.publish(step);
            }
            Command::Submit(operation) => {
                let step = self.engine.submit(operation);
                self.publish(step);
            }
            Command::LoadMore(reply) => {
                let step = self.engine.load_more(reply);
                self.publish(step);
            }
            Command::Refresh(reply) => {
                let result = self.engine.refresh().map(|step| self.publish(step));
                let _ = reply.send(result);
            }
            Command::RetrySend { local_id, reply } => {
                let result = self.engine.retry_send(&local_id).map(|step| self.publish(step));
                let _ = reply.send(result);
            }
            Command::DiscardFailed { local_id, reply } => {
                let result = self
                    .engine
                    .discard_failed(&local_id)
                    .map(|step| self.publish(step));
                let _ = reply.send(result);
            }
            Command::MarkRead { message_id, reply } => {
                let position = match message_id {
                    Some(message_id) => self.engine.read_position_for(&message_id).map(Some),
                    None => Ok(self.engine.latest_read_position()),
                };
                let result = position.map(|position| {
                    position.is_some_and(|position| self.read_positions.mark_read(position))
                });
                let _ = reply.send(result);
            }
            Command::ReadPosition(reply) => {
                let _ = reply.send(self.read_positions.current(&self.chat_id).cloned());
            }
            Command::UnreadCount(reply) => {
                let marker = self.read_positions.current(&self.chat_id);
                let _ = reply.send(self.engine.unread_count(marker));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Close(_) => {}
        }
    }

    fn publish(&mut self, step: Step) {
        for diff in step.diffs {
            if let LogDiff::Status(status) = diff {
                self.status.send_replace(status);
            }
            if let Some(diffs) = &self.diffs {
                let _ = diffs.send(diff);
            }
        }
        for effect in step.effects {
            match effect {
                engine::Effect::FetchHistory(request) => self.spawn_fetch(request),
                engine::Effect::Submit(operation) => self.spawn_submit(operation),
                engine::Effect::AuthFailure(err) => self.services.auth.on_auth_failure(&err),
            }
        }
    }

    fn spawn_fetch(&mut self, request: HistoryRequest) {
        let history = Arc::clone(&self.services.history);
        let inbox = self.inbox.clone();
        let chat_id = self.chat_id.clone();
        let backoff = self.backoff;
        self.history_task = Some(tokio::spawn(async move {
            let result = retry_transient(backoff, "fetch_page", || {
                let history = Arc::clone(&history);
                let chat_id = chat_id.clone();
                let before = request.before.clone();
                let count = request.count;
                async move { history.fetch_page(&chat_id, before, count).await }
            })
            .await;
            let _ = inbox.send(Command::Input(EngineInput::HistoryPage { request, result }));
        }));
    }

    fn spawn_submit(&self, operation: PendingOperation) {
        let sink = Arc::clone(&self.services.sink);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = sink.submit(&operation).await;
            let _ = inbox.send(Command::Input(EngineInput::OperationResult {
                local_id: operation.local_id,
                result,
            }));
        });
    }

    async fn shutdown(&mut self) -> Result<(), SyncError> {
        if let Some(task) = self.stream_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        let flushed = self.read_positions.flush().await;
        if let Err(err) = &flushed {
            warn!(chat_id = %self.chat_id, "session: failed to persist read position: {err}");
        }
        let step = self.engine.close();
        self.publish(step);
        self.diffs = None;
        flushed.map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
