//! Tiered memory: every message goes to the fast tier, every n-th one is
//! also archived, and reads pick a tier by message count.

use std::sync::Arc;

use parley_config::MemoryConfig;
use parley_core::Message;
use parley_llm::Embedder;
use parley_observability::MemoryMetrics;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{InMemoryVectorIndex, SemanticArchive, VectorIndex};
use crate::error::MemoryResult;
use crate::strategy::{MemoryStrategy, MemoryStrategySelector};
use crate::window::{InMemoryRecentWindow, RecentWindowStore};

/// Messages selected for a turn plus the strategy that produced them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    pub strategy: Option<MemoryStrategy>,
    pub messages: Vec<Message>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether `messages` came from archive recall rather than the window.
    pub fn is_recall(&self) -> bool {
        self.strategy == Some(MemoryStrategy::Semantic)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub window_sessions: usize,
    pub window_messages: usize,
    pub archive_entries: usize,
}

pub struct TieredMemoryManager {
    selector: MemoryStrategySelector,
    window: Arc<dyn RecentWindowStore>,
    archive: SemanticArchive,
    window_size: usize,
    recall_top_k: usize,
}

impl std::fmt::Debug for TieredMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredMemoryManager")
            .field("selector", &self.selector)
            .field("window_size", &self.window_size)
            .field("recall_top_k", &self.recall_top_k)
            .finish()
    }
}

impl TieredMemoryManager {
    pub fn new(
        config: &MemoryConfig,
        window: Arc<dyn RecentWindowStore>,
        archive: SemanticArchive,
    ) -> Self {
        Self {
            selector: MemoryStrategySelector::from_config(config),
            window,
            archive,
            window_size: config.window_size.max(1),
            recall_top_k: config.recall_top_k,
        }
    }

    /// Manager with in-process tiers around the given embedder.
    pub fn in_memory(config: &MemoryConfig, embedder: Arc<dyn Embedder>) -> Self {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        Self::new(
            config,
            Arc::new(InMemoryRecentWindow::from_config(config)),
            SemanticArchive::new(embedder, index),
        )
    }

    pub fn selector(&self) -> &MemoryStrategySelector {
        &self.selector
    }

    pub fn archive(&self) -> &SemanticArchive {
        &self.archive
    }

    /// Messages kept per session in the fast tier
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Record `message` as the `message_count`-th message of the session.
    ///
    /// Fast-tier errors propagate. Archive errors are logged and dropped.
    pub async fn add_message(
        &self,
        session_id: &str,
        message: &Message,
        message_count: usize,
    ) -> MemoryResult<()> {
        let window_len = self.window.push(session_id, message.clone()).await?;

        if self.selector.should_archive(message_count) {
            match self.archive.archive(session_id, message).await {
                Ok(written) => {
                    debug!(session_id, message_count, written, "Archive checkpoint");
                }
                Err(e) => {
                    MemoryMetrics::record_archive_failure();
                    warn!(session_id, message_id = %message.id, "Failed to archive message: {}", e);
                }
            }
        }

        debug!(
            session_id,
            window_len,
            strategy = %self.selector.select(message_count),
            "Added message to memory"
        );
        Ok(())
    }

    /// Context for the next turn of a session with `message_count` messages.
    pub async fn get_context(
        &self,
        session_id: &str,
        query: &str,
        message_count: usize,
    ) -> MemoryResult<MemoryContext> {
        let strategy = self.selector.select(message_count);
        let messages = match strategy {
            MemoryStrategy::Basic => Vec::new(),
            MemoryStrategy::RecentWindow => self.window.get(session_id).await?,
            MemoryStrategy::Semantic => {
                match self.archive.recall(session_id, query, self.recall_top_k).await {
                    Ok(hits) => hits.into_iter().map(|h| h.into_message()).collect(),
                    Err(e) => {
                        warn!(session_id, "Semantic recall failed, continuing without it: {}", e);
                        Vec::new()
                    }
                }
            }
        };

        Ok(MemoryContext {
            strategy: Some(strategy),
            messages,
        })
    }

    /// Drop both tiers for a session.
    pub async fn clear(&self, session_id: &str) -> MemoryResult<()> {
        self.window.clear(session_id).await?;
        let removed = self.archive.clear(session_id).await?;
        info!(session_id, archive_removed = removed, "Cleared session memory");
        Ok(())
    }

    /// Refill an empty fast tier from persisted history. Returns whether
    /// anything was restored.
    pub async fn restore_from_history(
        &self,
        session_id: &str,
        history: &[Message],
    ) -> MemoryResult<bool> {
        if history.is_empty() || !self.window.is_empty(session_id).await? {
            return Ok(false);
        }

        let start = history.len().saturating_sub(self.window_size);
        let recent = history[start..].to_vec();
        let count = recent.len();
        let restored = self.window.restore(session_id, recent).await?;
        if restored {
            info!(session_id, count, "Restored fast tier from history");
        }
        Ok(restored)
    }

    /// Archive every memorable message of the history. Already archived ids
    /// are skipped, so reruns are cheap.
    pub async fn embed_history(&self, session_id: &str, history: &[Message]) -> MemoryResult<usize> {
        let written = self.archive.archive_all(session_id, history).await?;
        info!(session_id, written, total = history.len(), "Embedded session history");
        Ok(written)
    }

    pub async fn purge_expired(&self) -> MemoryResult<usize> {
        self.window.purge_expired().await
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let window = self.window.stats().await?;
        Ok(MemoryStats {
            window_sessions: window.sessions,
            window_messages: window.messages,
            archive_entries: self.archive.len().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::HashEmbedder;

    fn manager_with(embedder: Arc<HashEmbedder>) -> TieredMemoryManager {
        TieredMemoryManager::in_memory(&MemoryConfig::default(), embedder)
    }

    async fn add_n(manager: &TieredMemoryManager, session_id: &str, from: usize, to: usize) {
        for n in from..=to {
            let message = Message::user(format!("message number {}", n));
            manager.add_message(session_id, &message, n).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fast_tier_never_exceeds_window() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));
        add_n(&manager, "s1", 1, 37).await;

        let context = manager.get_context("s1", "anything", 20).await.unwrap();
        assert_eq!(context.strategy, Some(MemoryStrategy::RecentWindow));
        assert_eq!(context.messages.len(), 10);
        assert_eq!(context.messages[9].content, "message number 37");
    }

    #[tokio::test]
    async fn test_archive_writes_every_tenth_message() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));

        add_n(&manager, "s1", 1, 10).await;
        assert_eq!(manager.stats().await.unwrap().archive_entries, 1);
        add_n(&manager, "s1", 11, 20).await;
        assert_eq!(manager.stats().await.unwrap().archive_entries, 2);
        add_n(&manager, "s1", 21, 30).await;
        assert_eq!(manager.stats().await.unwrap().archive_entries, 3);
    }

    #[tokio::test]
    async fn test_same_message_archived_once() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));
        let message = Message::assistant("a memorable reply").with_id("fixed");

        manager.add_message("s1", &message, 10).await.unwrap();
        manager.add_message("s1", &message, 20).await.unwrap();
        assert_eq!(manager.stats().await.unwrap().archive_entries, 1);
    }

    #[tokio::test]
    async fn test_basic_strategy_reads_nothing() {
        let embedder = Arc::new(HashEmbedder::default());
        let manager = manager_with(embedder.clone());
        add_n(&manager, "s1", 1, 3).await;

        let context = manager.get_context("s1", "Hello", 3).await.unwrap();
        assert!(context.is_empty());
        assert_eq!(context.strategy, Some(MemoryStrategy::Basic));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_semantic_recall() {
        let manager = manager_with(Arc::new(HashEmbedder::new(128)));
        add_n(&manager, "s1", 1, 9).await;
        let fact = Message::user("my favourite colour is teal");
        manager.add_message("s1", &fact, 10).await.unwrap();

        let context = manager
            .get_context("s1", "what is my favourite colour", 60)
            .await
            .unwrap();
        assert!(context.is_recall());
        assert_eq!(context.messages[0].id, fact.id);
    }

    #[tokio::test]
    async fn test_clear_empties_every_strategy() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));
        add_n(&manager, "s1", 1, 30).await;

        manager.clear("s1").await.unwrap();
        for n in [3, 30, 80] {
            let context = manager.get_context("s1", "message number", n).await.unwrap();
            assert!(context.is_empty(), "strategy for n={} not empty", n);
        }
        assert_eq!(manager.stats().await.unwrap(), MemoryStats::default());
    }

    #[tokio::test]
    async fn test_archive_failure_does_not_fail_turn() {
        let manager = manager_with(Arc::new(HashEmbedder::failing()));
        add_n(&manager, "s1", 1, 10).await;

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.window_messages, 10);
        assert_eq!(stats.archive_entries, 0);

        let context = manager.get_context("s1", "recall me", 60).await.unwrap();
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_history() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));
        let history: Vec<Message> = (1..=15).map(|i| Message::user(format!("h{}", i))).collect();

        assert!(manager.restore_from_history("s1", &history).await.unwrap());
        assert!(!manager.restore_from_history("s1", &history).await.unwrap());
        assert!(!manager.restore_from_history("s2", &[]).await.unwrap());

        let context = manager.get_context("s1", "", 15).await.unwrap();
        assert_eq!(context.messages.len(), 10);
        assert_eq!(context.messages[0].content, "h6");
    }

    #[tokio::test]
    async fn test_embed_history_is_idempotent() {
        let manager = manager_with(Arc::new(HashEmbedder::default()));
        let history = vec![
            Message::user("first question"),
            Message::assistant("first answer"),
            Message::system("ignored"),
        ];

        assert_eq!(manager.embed_history("s1", &history).await.unwrap(), 2);
        assert_eq!(manager.embed_history("s1", &history).await.unwrap(), 0);
    }
}
