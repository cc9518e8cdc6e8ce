//! Gateway-related errors

use parley_core::{ErrorCode, ServerEvent};
use parley_relay::RelayError;
use parley_runner::RunnerError;
use parley_session::StorageError;
use thiserror::Error;

/// Failures of room and connection operations. Each maps to a wire
/// `error` event for the offending connection.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("User {user_id} does not own session {session_id}")]
    Unauthorized { user_id: String, session_id: String },

    #[error("Invalid auth token")]
    InvalidToken,

    #[error("Connection not registered: {0}")]
    NotConnected(String),

    #[error("Connection is already registered")]
    AlreadyConnected,

    #[error("Connection is already in room {0}, leave it first")]
    AlreadyInRoom(String),

    #[error("Connection is not in room {0}")]
    NotInRoom(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::Unauthorized { .. } | RoomError::InvalidToken => ErrorCode::Unauthorized,
            RoomError::NotConnected(_) => ErrorCode::NotConnected,
            RoomError::AlreadyConnected | RoomError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            RoomError::AlreadyInRoom(_) => ErrorCode::AlreadyInRoom,
            RoomError::NotInRoom(_) => ErrorCode::NotInRoom,
            RoomError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RoomError::Runner(RunnerError::QueueUnavailable(_)) => ErrorCode::QueueUnavailable,
            RoomError::Runner(RunnerError::InvalidRequest(_)) => ErrorCode::InvalidMessage,
            RoomError::Relay(_) | RoomError::Storage(_) | RoomError::Runner(_) => ErrorCode::Internal,
        }
    }

    /// Wire form. Internal failures get a generic message.
    pub fn to_event(&self) -> ServerEvent {
        let message = match self.code() {
            ErrorCode::Internal => "Internal server error".to_string(),
            ErrorCode::QueueUnavailable => "Message could not be queued, try again".to_string(),
            _ => self.to_string(),
        };
        ServerEvent::error(self.code(), message)
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
