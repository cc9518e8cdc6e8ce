//! 内存会话存储，用于测试以及不需要重启后保留历史的单进程部署。

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{Message, Session};

use crate::error::{StorageError, StorageResult};
use crate::store::{tail, ChatStore, StorageStats};

#[derive(Debug)]
struct SessionRecord {
    session: Session,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    sessions: DashMap<String, SessionRecord>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_session(&self, session: &Session) -> StorageResult<()> {
        match self.sessions.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::SessionAlreadyExists {
                id: session.id.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionRecord {
                    session: session.clone(),
                    messages: Vec::new(),
                });
                Ok(())
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|r| r.session.clone()))
    }

    async fn list_user_sessions(&self, user_id: &str) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|r| r.session.is_owned_by(user_id))
            .map(|r| r.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> StorageResult<usize> {
        if !message.is_complete() {
            return Err(StorageError::IncompleteMessage {
                id: message.id.clone(),
            });
        }
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::not_found(session_id))?;
        record.messages.push(message.clone());
        record.session.touch();
        Ok(record.messages.len())
    }

    async fn history(&self, session_id: &str, limit: Option<usize>) -> StorageResult<Vec<Message>> {
        let messages = self
            .sessions
            .get(session_id)
            .map(|r| r.messages.clone())
            .ok_or_else(|| StorageError::not_found(session_id))?;
        Ok(tail(messages, limit))
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            total_sessions: self.sessions.len() as u64,
            total_messages: self.sessions.iter().map(|r| r.messages.len() as u64).sum(),
        })
    }
}
