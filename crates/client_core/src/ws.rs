use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use shared::{domain::ChatId, protocol::ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    error::SyncError,
    retry::Backoff,
    types::{DisconnectReason, StreamEvent},
    AuthProvider, LiveStream, LiveSubscription,
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum ConnectError {
    Unauthorized(String),
    Transport(String),
}

/// Push channel for one chat over the server's WebSocket endpoint.
///
/// Reconnects with backoff after any transport failure. Missed events are
/// not replayed; the consumer closes gaps from history.
#[derive(Clone)]
pub struct WsLiveStream {
    server_url: String,
    auth: Arc<dyn AuthProvider>,
    backoff: Backoff,
}

impl WsLiveStream {
    pub fn new(server_url: impl Into<String>, auth: Arc<dyn AuthProvider>, backoff: Backoff) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth,
            backoff,
        }
    }

    pub fn stream_url(&self, chat_id: &ChatId) -> Result<Url, SyncError> {
        let ws_base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(SyncError::Protocol(
                "server_url must start with http:// or https://".into(),
            ));
        };
        let mut url = Url::parse(&format!("{ws_base}/ws"))
            .map_err(|err| SyncError::Protocol(format!("invalid server_url: {err}")))?;
        url.query_pairs_mut().append_pair("chat_id", chat_id.as_str());
        Ok(url)
    }

    async fn connect(&self, url: &Url) -> Result<Socket, ConnectError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        if let Some(token) = self.auth.current_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ConnectError::Unauthorized(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        match connect_async(request).await {
            Ok((socket, _)) => Ok(socket),
            Err(WsError::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(ConnectError::Unauthorized(format!(
                    "websocket upgrade rejected with {}",
                    response.status()
                )))
            }
            Err(err) => Err(ConnectError::Transport(err.to_string())),
        }
    }

    async fn run(self, chat_id: ChatId, url: Url, events: mpsc::UnboundedSender<StreamEvent>) {
        let mut failures: u32 = 0;
        let mut announced_down = false;
        let mut exhausted_reported = false;

        loop {
            if events.is_closed() {
                return;
            }
            match self.connect(&url).await {
                Ok(socket) => {
                    info!(chat_id = %chat_id, "ws: connected");
                    failures = 0;
                    exhausted_reported = false;
                    if events.send(StreamEvent::Connected).is_err() {
                        return;
                    }
                    let reason = pump(socket, &chat_id, &events).await;
                    info!(chat_id = %chat_id, ?reason, "ws: disconnected");
                    announced_down = true;
                    if events.send(StreamEvent::Disconnected(reason)).is_err() {
                        return;
                    }
                }
                Err(ConnectError::Unauthorized(reason)) => {
                    warn!(chat_id = %chat_id, "ws: unauthorized: {reason}");
                    let _ = events.send(StreamEvent::Disconnected(DisconnectReason::Unauthorized(
                        reason,
                    )));
                    return;
                }
                Err(ConnectError::Transport(reason)) => {
                    failures = failures.saturating_add(1);
                    warn!(chat_id = %chat_id, attempt = failures, "ws: connect failed: {reason}");
                    if !announced_down {
                        announced_down = true;
                        if events
                            .send(StreamEvent::Disconnected(DisconnectReason::Transport(reason)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    if failures >= self.backoff.max_attempts && !exhausted_reported {
                        exhausted_reported = true;
                        if events
                            .send(StreamEvent::Disconnected(DisconnectReason::RetriesExhausted))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_after(failures.max(1))).await;
        }
    }
}

#[async_trait]
impl LiveStream for WsLiveStream {
    async fn subscribe(&self, chat_id: &ChatId) -> Result<LiveSubscription, SyncError> {
        let url = self.stream_url(chat_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().run(chat_id.clone(), url, tx));
        Ok(LiveSubscription::new(rx, task))
    }
}

async fn pump(
    mut socket: Socket,
    chat_id: &ChatId,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> DisconnectReason {
    while let Some(frame) = socket.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    if let Some(event) = to_stream_event(event, chat_id) {
                        if events.send(event).is_err() {
                            return DisconnectReason::Closed;
                        }
                    }
                }
                Err(err) => warn!(chat_id = %chat_id, "ws: undecodable frame: {err}"),
            },
            Ok(WsMessage::Close(_)) => return DisconnectReason::Closed,
            Ok(_) => {}
            Err(err) => return DisconnectReason::Transport(err.to_string()),
        }
    }
    DisconnectReason::Closed
}

/// Translates a wire event for `chat_id`; events for other chats are dropped.
pub fn to_stream_event(event: ServerEvent, chat_id: &ChatId) -> Option<StreamEvent> {
    if let ServerEvent::Error(err) = &event {
        warn!(chat_id = %chat_id, "ws: server reported error: {err}");
        return None;
    }
    if event.chat_id() != Some(chat_id) {
        return None;
    }
    match event {
        ServerEvent::MessageCreated { message } => Some(StreamEvent::NewMessage(message)),
        ServerEvent::MessageEdited {
            message_id,
            content,
            edited_version,
            ..
        } => Some(StreamEvent::Edited {
            id: message_id,
            content,
            version: edited_version,
        }),
        ServerEvent::MessageRecalled { message_id, .. } => Some(StreamEvent::Recalled(message_id)),
        ServerEvent::MessageChunk {
            message_id, delta, ..
        } => Some(StreamEvent::Chunk {
            id: message_id,
            delta,
        }),
        ServerEvent::Error(_) => None,
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
