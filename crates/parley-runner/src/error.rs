use parley_memory::MemoryError;
use parley_queue::QueueError;
use parley_session::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid turn request: {0}")]
    InvalidRequest(String),

    /// Enqueue failed; surfaced synchronously to the caller
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Agent execution failed: {0}")]
    Agent(String),

    #[error("Job timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl RunnerError {
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent(message.into())
    }
}

impl From<parley_llm::LLMError> for RunnerError {
    fn from(e: parley_llm::LLMError) -> Self {
        Self::Generation(e.to_string())
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
