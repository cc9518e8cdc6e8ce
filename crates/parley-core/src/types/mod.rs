pub mod message;
pub mod session;
pub mod usage;

pub use message::{Message, MessageId, Role};
pub use session::{AgentSettings, Session, SessionId, UserId};
pub use usage::TokenUsage;
