//! # Chat Store Trait
//!
//! 会话和消息历史的持久化契约。消息历史按会话追加写入，读取时按时间正序返回。

use async_trait::async_trait;
use parley_core::{Message, Session};

use crate::error::StorageResult;

/// 会话存储 trait
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 创建新会话
    async fn create_session(&self, session: &Session) -> StorageResult<()>;

    /// 加载会话元数据
    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>>;

    /// 获取用户的所有会话，最近活动的在前
    async fn list_user_sessions(&self, user_id: &str) -> StorageResult<Vec<Session>>;

    /// 追加一条已完成的消息，返回追加后的消息总数
    async fn append_message(&self, session_id: &str, message: &Message) -> StorageResult<usize>;

    /// 读取消息历史（正序）；`limit` 只保留最后 N 条
    async fn history(&self, session_id: &str, limit: Option<usize>) -> StorageResult<Vec<Message>>;

    /// 删除会话及其消息
    async fn delete_session(&self, session_id: &str) -> StorageResult<()>;

    /// 获取存储统计信息
    async fn stats(&self) -> StorageResult<StorageStats>;

    /// 会话消息数
    async fn message_count(&self, session_id: &str) -> StorageResult<usize> {
        Ok(self
            .get_session(session_id)
            .await?
            .map(|s| s.message_count)
            .unwrap_or(0))
    }

    /// 用户是否拥有该会话；会话不存在时返回 false
    async fn is_owner(&self, session_id: &str, user_id: &str) -> StorageResult<bool> {
        Ok(self
            .get_session(session_id)
            .await?
            .map(|s| s.is_owned_by(user_id))
            .unwrap_or(false))
    }
}

/// 存储统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// 总会话数
    pub total_sessions: u64,
    /// 总消息数
    pub total_messages: u64,
}

/// 截取最后 `limit` 条
pub(crate) fn tail(mut messages: Vec<Message>, limit: Option<usize>) -> Vec<Message> {
    if let Some(limit) = limit {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
    }
    messages
}
