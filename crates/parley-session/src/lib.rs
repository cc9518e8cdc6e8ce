//! # Parley Chat Store
//!
//! 会话与消息历史的持久化存储。
//!
//! ## 功能特性
//!
//! - **会话元数据**：所有者、标题、Agent/模型配置、消息计数
//! - **消息历史**：按会话追加写入，只接受已完成的消息
//! - **两种实现**：`InMemoryChatStore`（DashMap）和 `JsonlChatStore`（文件）
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use parley_core::{Message, Session};
//! use parley_session::{ChatStore, JsonlChatStore, JsonlStoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = JsonlChatStore::new(JsonlStoreConfig::new("~/.parley/sessions")).await?;
//!
//!     let session = Session::new("user-123");
//!     store.create_session(&session).await?;
//!     store.append_message(&session.id, &Message::user("Hello")).await?;
//!
//!     let history = store.history(&session.id, Some(10)).await?;
//!     println!("{} messages", history.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod jsonl_store;
pub mod memory_store;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use jsonl_store::{JsonlChatStore, JsonlStoreConfig};
pub use memory_store::InMemoryChatStore;
pub use store::{ChatStore, StorageStats};

/// 默认存储目录
pub fn default_storage_path() -> std::path::PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".parley").join("sessions"))
        .unwrap_or_else(|| std::path::PathBuf::from("./parley_sessions"))
}
