use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: &'static str,
    },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
