//! # Storage Error Types
//!
//! 定义聊天存储相关的错误类型。

use thiserror::Error;

/// 存储错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 会话不存在
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// 会话已存在
    #[error("Session already exists: {id}")]
    SessionAlreadyExists { id: String },

    /// 消息尚未完成，不能持久化
    #[error("Message {id} is not complete")]
    IncompleteMessage { id: String },

    /// 配置错误
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// 其他错误
    #[error("Storage error: {message}")]
    Other { message: String },
}

impl StorageError {
    /// 创建其他错误
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// 创建配置错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }
}

/// 存储结果类型
pub type StorageResult<T> = Result<T, StorageError>;
