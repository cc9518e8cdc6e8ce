//! WebSocket protocol definitions
//!
//! Client frames are flat JSON objects tagged by `type`. Server frames are
//! [`ServerEvent`](parley_core::ServerEvent)s, `{type, data}`.

use serde::{Deserialize, Serialize};

/// Messages sent from client to gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on a connection
    Connect {
        /// Identity established by the external auth layer
        user_id: String,
        /// Shared gateway token, checked when one is configured
        #[serde(default)]
        token: Option<String>,
    },
    /// Bind the connection to an existing chat the user owns
    JoinRoom { chat_id: String },
    /// Create a chat owned by the user and join it
    CreateRoom {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        /// Dispatched as the first turn when present
        #[serde(default)]
        message: Option<String>,
    },
    LeaveRoom,
    /// User turn for the joined chat
    Message { chat_id: String, content: String },
    /// Heartbeat ping
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::Message { .. } => "message",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}
