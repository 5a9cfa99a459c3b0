use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id_newtype!(ChatId);
string_id_newtype!(UserId);
// Server-assigned. Ordering is only ever used as a deterministic tie-break.
string_id_newtype!(MessageId);
string_id_newtype!(LocalId);

impl LocalId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Markdown,
    Html,
    Image,
    File,
    Sticker,
    Video,
    Form,
    Article,
}

/// Lifecycle of a confirmed message. `Recalled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    #[default]
    Active,
    Edited,
    Recalled,
}

impl MessageState {
    pub fn is_recalled(self) -> bool {
        matches!(self, MessageState::Recalled)
    }
}

/// Last-read marker for one chat. Ordered by `(last_read_time, last_read_message_id)`,
/// the same total order the message log uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition {
    pub chat_id: ChatId,
    pub last_read_message_id: MessageId,
    pub last_read_time: DateTime<Utc>,
}

impl ReadPosition {
    pub fn is_after(&self, other: &ReadPosition) -> bool {
        (self.last_read_time, &self.last_read_message_id)
            > (other.last_read_time, &other.last_read_message_id)
    }
}
