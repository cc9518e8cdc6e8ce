//! Semantic tier: embedded messages searchable by similarity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_core::{Message, Role};
use parley_llm::Embedder;
use parley_observability::MemoryMetrics;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};

/// One archived message. `id` is the original message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

/// Query hit with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: ArchiveEntry,
    pub score: f32,
}

impl ScoredEntry {
    /// Recalled passage as a pseudo-message carrying its relevance score.
    pub fn into_message(self) -> Message {
        Message::new(self.entry.role, self.entry.content)
            .with_id(self.entry.id)
            .with_timestamp(self.entry.created_at)
            .with_metadata("relevance_score", serde_json::json!(self.score))
    }
}

/// Vector search collaborator.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert, or replace the entry with the same id. Returns true when the
    /// id was not indexed before.
    async fn upsert(&self, entry: ArchiveEntry) -> MemoryResult<bool>;

    async fn contains(&self, id: &str) -> MemoryResult<bool>;

    /// Top `k` entries by descending similarity, optionally restricted to
    /// one session.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        session_id: Option<&str>,
    ) -> MemoryResult<Vec<ScoredEntry>>;

    async fn delete_by_session(&self, session_id: &str) -> MemoryResult<usize>;

    async fn len(&self) -> MemoryResult<usize>;
}

/// Cosine similarity; zero for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Brute-force index over a DashMap. Fine for tests and small deployments.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    entries: DashMap<String, ArchiveEntry>,
    dimensions: parking_lot::RwLock<Option<usize>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_dimensions(&self, actual: usize) -> MemoryResult<()> {
        let mut dimensions = self.dimensions.write();
        match *dimensions {
            Some(expected) if expected != actual => {
                Err(MemoryError::DimensionMismatch { expected, actual })
            }
            Some(_) => Ok(()),
            None => {
                *dimensions = Some(actual);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, entry: ArchiveEntry) -> MemoryResult<bool> {
        self.check_dimensions(entry.vector.len())?;
        Ok(self.entries.insert(entry.id.clone(), entry).is_none())
    }

    async fn contains(&self, id: &str) -> MemoryResult<bool> {
        Ok(self.entries.contains_key(id))
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        session_id: Option<&str>,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<ScoredEntry> = self
            .entries
            .iter()
            .filter(|e| session_id.map_or(true, |id| e.session_id == id))
            .map(|e| ScoredEntry {
                score: cosine_similarity(vector, &e.vector),
                entry: e.value().clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_by_session(&self, session_id: &str) -> MemoryResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.session_id != session_id);
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn len(&self) -> MemoryResult<usize> {
        Ok(self.entries.len())
    }
}

/// Embeds messages into a [`VectorIndex`], once per message id.
#[derive(Clone)]
pub struct SemanticArchive {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl std::fmt::Debug for SemanticArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticArchive").finish_non_exhaustive()
    }
}

impl SemanticArchive {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Archive one message. Returns false without embedding when the message
    /// is already archived or has nothing worth recalling.
    pub async fn archive(&self, session_id: &str, message: &Message) -> MemoryResult<bool> {
        if !message.is_memorable() || self.index.contains(&message.id).await? {
            return Ok(false);
        }

        let vector = self.embedder.embed(message.content.trim()).await?;
        let inserted = self
            .index
            .upsert(ArchiveEntry {
                id: message.id.clone(),
                session_id: session_id.to_string(),
                role: message.role,
                content: message.content.trim().to_string(),
                created_at: message.created_at,
                vector,
            })
            .await?;

        if inserted {
            MemoryMetrics::record_archive_write();
            debug!(session_id, message_id = %message.id, "Archived message");
        }
        Ok(inserted)
    }

    /// Archive a batch, returning how many new entries were written.
    pub async fn archive_all(&self, session_id: &str, messages: &[Message]) -> MemoryResult<usize> {
        let mut written = 0;
        for message in messages {
            if self.archive(session_id, message).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub async fn recall(
        &self,
        session_id: &str,
        query: &str,
        k: usize,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        MemoryMetrics::record_recall();
        let vector = self.embedder.embed(query).await?;
        self.index.query(&vector, k, Some(session_id)).await
    }

    pub async fn clear(&self, session_id: &str) -> MemoryResult<usize> {
        self.index.delete_by_session(session_id).await
    }

    pub async fn len(&self) -> MemoryResult<usize> {
        self.index.len().await
    }
}
