use thiserror::Error;

/// Unified error type for generation and embedding calls
#[derive(Error, Debug)]
pub enum LLMError {
    #[error("network error: {0}")]
    Network(String),

    #[error("api error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
}

impl LLMError {
    /// Map a non-success HTTP status to the matching error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LLMError::Auth(body),
            429 => LLMError::RateLimited { retry_after: 60 },
            _ => LLMError::Api {
                status,
                message: body,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, LLMError>;
