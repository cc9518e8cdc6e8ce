//! Events delivered to clients over the live connection
//!
//! Every event is serialized as `{"type": ..., "data": ...}`; `data` is
//! an object except for `chunk`, whose data is the text itself. Turn events
//! (status, chunks, usage, end, errors) travel through the relay so any
//! process holding a connection for the session can forward them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

/// Message shown to clients when a turn fails. Internal details stay in logs.
pub const GENERIC_TURN_ERROR: &str = "An error occurred while processing your message";

/// Events sent from the server to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection registered
    Connected {
        connection_id: String,
        user_id: String,
    },
    /// Connection bound to a chat room
    RoomJoined { chat_id: String, message: String },
    /// A new chat room was created and joined
    RoomCreated {
        chat_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        agent_id: Option<String>,
        created_at: DateTime<Utc>,
    },
    /// Connection left its room
    RoomLeft { chat_id: String },
    /// Acknowledges a user message that was accepted for generation
    MessageSent {
        message_id: String,
        chat_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Turn progress, e.g. "thinking" or "generating"
    Status { status: TurnStatus, message: String },
    /// Tools invoked by an agent for this turn
    ToolsUsed { tools: Vec<String>, message: String },
    /// One streamed piece of the assistant response
    Chunk(String),
    /// Token usage for the finished turn
    TokenUsage(TokenUsage),
    /// The turn finished; no more chunks follow
    End {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message_id: Option<String>,
        usage: TokenUsage,
    },
    /// Error response
    Error { code: ErrorCode, message: String },
    /// Heartbeat reply
    Pong { timestamp: i64 },
    /// A user came online or went offline
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    /// Another connection joined the room
    UserJoined { user_id: String, chat_id: String },
    /// Another connection left the room
    UserLeft { user_id: String, chat_id: String },
}

impl ServerEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk(content.into())
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// The user-safe error published when a turn fails.
    pub fn turn_failed() -> Self {
        Self::error(ErrorCode::GenerationFailed, GENERIC_TURN_ERROR)
    }

    pub fn status(status: TurnStatus) -> Self {
        Self::Status {
            status,
            message: status.default_message().to_string(),
        }
    }

    /// Wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomCreated { .. } => "room_created",
            Self::RoomLeft { .. } => "room_left",
            Self::MessageSent { .. } => "message_sent",
            Self::Status { .. } => "status",
            Self::ToolsUsed { .. } => "tools_used",
            Self::Chunk(_) => "chunk",
            Self::TokenUsage(_) => "token_usage",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
            Self::Presence { .. } => "presence",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
        }
    }

    /// Whether this event closes a turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// Progress states reported while a turn is being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Thinking,
    Generating,
}

impl TurnStatus {
    pub fn default_message(&self) -> &'static str {
        match self {
            TurnStatus::Thinking => "Agent is processing your request...",
            TurnStatus::Generating => "Generating response...",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Machine-readable error codes carried by `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    NotConnected,
    NotInRoom,
    AlreadyInRoom,
    SessionNotFound,
    InvalidMessage,
    QueueUnavailable,
    GenerationFailed,
    CapacityExceeded,
    Internal,
}
