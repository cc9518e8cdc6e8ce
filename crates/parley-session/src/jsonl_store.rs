//! # JsonlChatStore
//!
//! 基于 JSONL 文件的会话持久化存储实现。
//!
//! 存储结构:
//! ```text
//! <base_path>/
//! ├── <session_id>.json      # 会话元数据
//! ├── <session_id>.jsonl     # 消息历史(追加写入)
//! └── ...
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use parley_core::{Message, Session};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::store::{tail, ChatStore, StorageStats};

/// JsonlChatStore 配置
#[derive(Debug, Clone)]
pub struct JsonlStoreConfig {
    /// 存储根目录，支持 `~`
    pub base_path: PathBuf,
    /// 启动时是否扫描目录重建元数据缓存
    pub load_on_start: bool,
}

impl JsonlStoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            load_on_start: true,
        }
    }

    /// 跳过启动扫描
    pub fn lazy(mut self) -> Self {
        self.load_on_start = false;
        self
    }
}

impl Default for JsonlStoreConfig {
    fn default() -> Self {
        Self::new("~/.parley/sessions")
    }
}

/// JsonlChatStore 实现
pub struct JsonlChatStore {
    base_path: PathBuf,
    /// 会话元数据缓存
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    /// 串行化写入，保证消息文件和元数据中的计数一致
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for JsonlChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlChatStore")
            .field("base_path", &self.base_path)
            .field("cached_sessions", &self.sessions.read().len())
            .finish()
    }
}

impl JsonlChatStore {
    /// 创建新的 JsonlChatStore 实例
    pub async fn new(config: JsonlStoreConfig) -> StorageResult<Self> {
        let base_path_str = config.base_path.to_string_lossy().to_string();
        let base_path = PathBuf::from(shellexpand::tilde(&base_path_str).as_ref());

        fs::create_dir_all(&base_path).await?;

        let store = Self {
            base_path,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            write_lock: Mutex::new(()),
        };

        if config.load_on_start {
            let count = store.load_index().await?;
            info!("JsonlChatStore loaded {} sessions from {:?}", count, store.base_path);
        } else {
            info!("JsonlChatStore initialized at {:?}", store.base_path);
        }

        Ok(store)
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", session_id))
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", session_id))
    }

    async fn save_metadata(&self, session: &Session) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(session)?;
        fs::write(self.metadata_path(&session.id), content).await?;
        Ok(())
    }

    async fn load_metadata(&self, session_id: &str) -> StorageResult<Option<Session>> {
        let path = self.metadata_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// 会话元数据，优先读缓存
    async fn session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        if let Some(session) = self.sessions.read().get(session_id).cloned() {
            return Ok(Some(session));
        }
        let loaded = self.load_metadata(session_id).await?;
        if let Some(ref session) = loaded {
            self.sessions
                .write()
                .insert(session.id.clone(), session.clone());
        }
        Ok(loaded)
    }

    /// 扫描目录加载全部元数据
    async fn load_index(&self) -> StorageResult<usize> {
        let mut entries = fs::read_dir(&self.base_path).await?;
        let mut loaded = HashMap::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => {
                    loaded.insert(session.id.clone(), session);
                }
                Err(e) => warn!("Failed to parse session metadata {:?}: {}", path, e),
            }
        }

        let count = loaded.len();
        *self.sessions.write() = loaded;
        Ok(count)
    }

    async fn append_line(&self, session_id: &str, message: &Message) -> StorageResult<()> {
        let line = serde_json::to_string(message)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path(session_id))
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_messages(&self, session_id: &str) -> StorageResult<Vec<Message>> {
        let path = self.messages_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let mut messages = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping unreadable message line in {}: {}", session_id, e),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChatStore for JsonlChatStore {
    async fn create_session(&self, session: &Session) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.session(&session.id).await?.is_some() {
            return Err(StorageError::SessionAlreadyExists {
                id: session.id.clone(),
            });
        }

        self.save_metadata(session).await?;
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());

        debug!("Created session {} for {}", session.id, session.owner_id);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        self.session(session_id).await
    }

    async fn list_user_sessions(&self, user_id: &str) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_owned_by(user_id))
            .cloned()
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

        let _guard = self.write_lock.lock().await;
        let mut session = self
            .session(session_id)
            .await?
            .ok_or_else(|| StorageError::not_found(session_id))?;

        self.append_line(session_id, message).await?;
        session.touch();
        self.save_metadata(&session).await?;

        let count = session.message_count;
        self.sessions.write().insert(session.id.clone(), session);
        Ok(count)
    }

    async fn history(&self, session_id: &str, limit: Option<usize>) -> StorageResult<Vec<Message>> {
        if self.session(session_id).await?.is_none() {
            return Err(StorageError::not_found(session_id));
        }
        let messages = self.read_messages(session_id).await?;
        Ok(tail(messages, limit))
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        for path in [self.metadata_path(session_id), self.messages_path(session_id)] {
            if path.exists() {
                fs::remove_file(&path).await?;
            }
        }
        self.sessions.write().remove(session_id);
        debug!("Deleted session data: {}", session_id);
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let sessions = self.sessions.read();
        Ok(StorageStats {
            total_sessions: sessions.len() as u64,
            total_messages: sessions.values().map(|s| s.message_count as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_in(dir: &TempDir) -> JsonlChatStore {
        JsonlChatStore::new(JsonlStoreConfig::new(dir.path()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_load_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir).await;

        let session = Session::with_id("test-session-1", "user-123").with_title("Greetings");
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session("test-session-1").await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "user-123");
        assert_eq!(loaded.title.as_deref(), Some("Greetings"));
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = store_in(&temp_dir).await;
            store.create_session(&Session::with_id("s1", "alice")).await.unwrap();
            store.append_message("s1", &Message::user("Hello")).await.unwrap();
            let count = store
                .append_message("s1", &Message::assistant("Hi there!"))
                .await
                .unwrap();
            assert_eq!(count, 2);
        }

        let reopened = store_in(&temp_dir).await;
        let history = reopened.history("s1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hi there!");
        assert_eq!(reopened.message_count("s1").await.unwrap(), 2);
        assert_eq!(reopened.stats().await.unwrap().total_messages, 2);
    }

    #[tokio::test]
    async fn test_skips_corrupt_lines() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir).await;
        store.create_session(&Session::with_id("s1", "alice")).await.unwrap();
        store.append_message("s1", &Message::user("ok")).await.unwrap();

        let path = temp_dir.path().join("s1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let history = store.history("s1", None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir).await;
        store.create_session(&Session::with_id("s1", "alice")).await.unwrap();
        store.append_message("s1", &Message::user("bye")).await.unwrap();

        store.delete_session("s1").await.unwrap();
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(!temp_dir.path().join("s1.jsonl").exists());
        assert!(matches!(
            store.history("s1", None).await,
            Err(StorageError::SessionNotFound { .. })
        ));
    }
}
