use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, ContentType, LocalId, MessageId, MessageState, UserId},
    error::ApiError,
};

/// Message body, decided once at deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Markdown {
        text: String,
    },
    Html {
        html: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    File {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    Sticker {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pack_id: Option<String>,
    },
    Video {
        url: String,
    },
    Form {
        form: String,
    },
    Article {
        post_id: String,
        title: String,
        #[serde(default)]
        body: String,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            MessageContent::Text { .. } => ContentType::Text,
            MessageContent::Markdown { .. } => ContentType::Markdown,
            MessageContent::Html { .. } => ContentType::Html,
            MessageContent::Image { .. } => ContentType::Image,
            MessageContent::File { .. } => ContentType::File,
            MessageContent::Sticker { .. } => ContentType::Sticker,
            MessageContent::Video { .. } => ContentType::Video,
            MessageContent::Form { .. } => ContentType::Form,
            MessageContent::Article { .. } => ContentType::Article,
        }
    }

    /// Appends a streamed delta. Only textual bodies accept chunks.
    pub fn append_text(&mut self, delta: &str) -> bool {
        match self {
            MessageContent::Text { text } | MessageContent::Markdown { text } => {
                text.push_str(delta);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub send_time: DateTime<Utc>,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<MessageId>,
    #[serde(default)]
    pub edited_version: u64,
    #[serde(default)]
    pub state: MessageState,
}

impl Message {
    pub fn content_type(&self) -> ContentType {
        self.content.content_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<MessageId>,
    pub client_ref: LocalId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: MessageContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditMessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_version: Option<u64>,
}

/// Push-channel frame as delivered over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: Message,
    },
    MessageEdited {
        chat_id: ChatId,
        message_id: MessageId,
        content: MessageContent,
        edited_version: u64,
    },
    MessageRecalled {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageChunk {
        chat_id: ChatId,
        message_id: MessageId,
        delta: String,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            ServerEvent::MessageCreated { message } => Some(&message.chat_id),
            ServerEvent::MessageEdited { chat_id, .. }
            | ServerEvent::MessageRecalled { chat_id, .. }
            | ServerEvent::MessageChunk { chat_id, .. } => Some(chat_id),
            ServerEvent::Error(_) => None,
        }
    }
}
