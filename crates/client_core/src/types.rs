//! Value types flowing between the adapters, the engine and the UI.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, LocalId, MessageId, MessageState},
    protocol::{Message, MessageContent},
};

/// Identity of one log entry. Provisional entries are keyed by their local id
/// until the server-confirmed message replaces them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey {
    Server(MessageId),
    Local(LocalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub key: EntryKey,
    pub message: Message,
    pub delivery: Delivery,
}

impl LogEntry {
    pub fn confirmed(message: Message) -> Self {
        Self {
            key: EntryKey::Server(message.id.clone()),
            message,
            delivery: Delivery::Confirmed,
        }
    }

    /// Total order: `send_time` ascending, then key ascending.
    pub fn order_key(&self) -> (DateTime<Utc>, &EntryKey) {
        (self.message.send_time, &self.key)
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, EntryKey::Local(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Live,
    Reconnecting,
    Degraded,
    AuthRequired,
    Closed,
}

impl SessionStatus {
    /// Sends and pagination are refused in these states.
    pub fn blocks_writes(self) -> bool {
        matches!(
            self,
            SessionStatus::Degraded | SessionStatus::AuthRequired | SessionStatus::Closed
        )
    }
}

/// Non-fatal, transient information for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    AlreadyHandled {
        local_id: LocalId,
        target_id: MessageId,
    },
    OperationFailed {
        local_id: LocalId,
        reason: String,
    },
}

/// Incremental change to the ordered log. Indices refer to the log after the
/// change has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDiff {
    Insert {
        index: usize,
        entry: LogEntry,
    },
    Replace {
        previous: EntryKey,
        index: usize,
        entry: LogEntry,
    },
    MarkState {
        key: EntryKey,
        index: usize,
        state: MessageState,
    },
    Delivery {
        key: EntryKey,
        index: usize,
        delivery: Delivery,
    },
    Remove {
        key: EntryKey,
        index: usize,
    },
    Status(SessionStatus),
    Notice(SessionNotice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    Transport(String),
    Unauthorized(String),
    RetriesExhausted,
}

/// Inbound events from the push channel of one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    NewMessage(Message),
    Edited {
        id: MessageId,
        content: MessageContent,
        version: u64,
    },
    Recalled(MessageId),
    Chunk {
        id: MessageId,
        delta: String,
    },
    Connected,
    Disconnected(DisconnectReason),
}

/// Opaque pagination token: "messages strictly older than this one".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub MessageId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub before: Cursor,
    pub oldest_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Send,
    Edit,
    Recall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationPayload {
    Send {
        content: MessageContent,
        quote_id: Option<MessageId>,
    },
    Edit {
        target_id: MessageId,
        content: MessageContent,
    },
    Recall {
        target_id: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InFlight,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub local_id: LocalId,
    pub chat_id: ChatId,
    pub payload: OperationPayload,
    pub submitted_at: DateTime<Utc>,
    pub status: OperationStatus,
}

impl PendingOperation {
    pub fn new(chat_id: ChatId, payload: OperationPayload) -> Self {
        Self {
            local_id: LocalId::generate(),
            chat_id,
            payload,
            submitted_at: Utc::now(),
            status: OperationStatus::InFlight,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.payload {
            OperationPayload::Send { .. } => OperationKind::Send,
            OperationPayload::Edit { .. } => OperationKind::Edit,
            OperationPayload::Recall { .. } => OperationKind::Recall,
        }
    }

    pub fn target_id(&self) -> Option<&MessageId> {
        match &self.payload {
            OperationPayload::Send { .. } => None,
            OperationPayload::Edit { target_id, .. } | OperationPayload::Recall { target_id } => {
                Some(target_id)
            }
        }
    }
}

/// Server acknowledgement of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationAck {
    Sent { message_id: Option<MessageId> },
    Edited { edited_version: Option<u64> },
    Recalled,
}

/// What `result_for` resolves to once the engine has merged the confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Sent { message_id: MessageId },
    Edited { message_id: MessageId, version: u64 },
    Recalled { message_id: MessageId },
}
