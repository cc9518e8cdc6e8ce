//! Shared domain types for Parley: messages, sessions, the generation
//! chunk stream and the events sent to clients.

pub mod chat;
pub mod event;
pub mod types;

pub use chat::{ChatChunk, FinishReason, GenerationOptions, GenerationRequest};
pub use event::{ErrorCode, PresenceStatus, ServerEvent, TurnStatus, GENERIC_TURN_ERROR};
pub use types::{AgentSettings, Message, MessageId, Role, Session, SessionId, TokenUsage, UserId};
