use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::{ChatId, MessageId},
    error::ApiError,
    protocol::{
        EditMessageRequest, EditMessageResponse, Message, SendMessageRequest, SendMessageResponse,
    },
};
use tracing::debug;

use crate::{
    error::SyncError,
    types::{Cursor, OperationAck, OperationPayload, PendingOperation},
    AuthProvider, HistoryFetcher, OperationSink,
};

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Serialize)]
struct ListMessagesQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
}

/// REST side of a chat: history pages and writes.
#[derive(Clone)]
pub struct HttpChatApi {
    http: Client,
    server_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_client(Client::new(), server_url, auth)
    }

    pub fn with_client(
        http: Client,
        server_url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.current_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn messages_url(&self, chat_id: &ChatId) -> String {
        format!("{}/chats/{}/messages", self.server_url, chat_id)
    }

    async fn send_message(
        &self,
        operation: &PendingOperation,
        request: SendMessageRequest,
    ) -> Result<OperationAck, SyncError> {
        let response = self
            .authorized(self.http.post(self.messages_url(&operation.chat_id)))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, None).await?;
        let body: SendMessageResponse = decode_optional_body(response).await?;
        Ok(OperationAck::Sent {
            message_id: body.message_id,
        })
    }

    async fn edit_message(
        &self,
        operation: &PendingOperation,
        target_id: &MessageId,
        request: EditMessageRequest,
    ) -> Result<OperationAck, SyncError> {
        let url = format!("{}/{}/edit", self.messages_url(&operation.chat_id), target_id);
        let response = self
            .authorized(self.http.post(url))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, Some(target_id)).await?;
        let body: EditMessageResponse = decode_optional_body(response).await?;
        Ok(OperationAck::Edited {
            edited_version: body.edited_version,
        })
    }

    async fn recall_message(
        &self,
        operation: &PendingOperation,
        target_id: &MessageId,
    ) -> Result<OperationAck, SyncError> {
        let url = format!("{}/{}/recall", self.messages_url(&operation.chat_id), target_id);
        let response = self.authorized(self.http.post(url)).send().await?;
        check_status(response, Some(target_id)).await?;
        Ok(OperationAck::Recalled)
    }
}

#[async_trait]
impl HistoryFetcher for HttpChatApi {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        before: Option<Cursor>,
        count: u32,
    ) -> Result<Vec<Message>, SyncError> {
        let limit = count.clamp(1, MAX_PAGE_SIZE);
        let response = self
            .authorized(self.http.get(self.messages_url(chat_id)))
            .query(&ListMessagesQuery {
                limit,
                before: before.as_ref().map(|cursor| cursor.0.as_str()),
            })
            .send()
            .await?;
        let response = match check_status(response, None).await {
            Err(SyncError::StaleOperation { .. }) => {
                return Err(match before {
                    Some(cursor) => SyncError::NotFound(cursor.0),
                    None => SyncError::Protocol(format!("chat {chat_id} not found")),
                })
            }
            other => other?,
        };
        let messages: Vec<Message> = response.json().await?;
        debug!(chat_id = %chat_id, limit, fetched = messages.len(), "http: fetched history page");
        Ok(messages)
    }
}

#[async_trait]
impl OperationSink for HttpChatApi {
    async fn submit(&self, operation: &PendingOperation) -> Result<OperationAck, SyncError> {
        match &operation.payload {
            OperationPayload::Send { content, quote_id } => {
                self.send_message(
                    operation,
                    SendMessageRequest {
                        content: content.clone(),
                        quote_id: quote_id.clone(),
                        client_ref: operation.local_id.clone(),
                    },
                )
                .await
            }
            OperationPayload::Edit { target_id, content } => {
                self.edit_message(
                    operation,
                    target_id,
                    EditMessageRequest {
                        content: content.clone(),
                    },
                )
                .await
            }
            OperationPayload::Recall { target_id } => self.recall_message(operation, target_id).await,
        }
    }
}

/// Maps non-success statuses onto the error taxonomy. `target` is the
/// message a write addresses; missing targets surface as stale operations.
async fn check_status(response: Response, target: Option<&MessageId>) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiError>(&body)
        .map(|err| err.to_string())
        .unwrap_or_else(|_| format!("{status}: {body}"));
    Err(map_status(status, target, detail))
}

pub(crate) fn map_status(status: StatusCode, target: Option<&MessageId>, detail: String) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(detail),
        StatusCode::CONFLICT => match target {
            Some(target_id) => SyncError::Conflict {
                target_id: target_id.clone(),
            },
            None => SyncError::Protocol(detail),
        },
        StatusCode::NOT_FOUND | StatusCode::GONE => SyncError::StaleOperation {
            target_id: target.cloned().unwrap_or_else(|| MessageId::new("")),
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => SyncError::Network(detail),
        status if status.is_server_error() => SyncError::Network(detail),
        _ => SyncError::Protocol(detail),
    }
}

async fn decode_optional_body<T>(response: Response) -> Result<T, SyncError>
where
    T: serde::de::DeserializeOwned + Default,
{
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&body).map_err(|err| SyncError::Protocol(err.to_string()))
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
