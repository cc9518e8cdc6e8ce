use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] parley_llm::LLMError),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("fast tier unavailable: {0}")]
    Window(String),

    #[error("archive unavailable: {0}")]
    Archive(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
