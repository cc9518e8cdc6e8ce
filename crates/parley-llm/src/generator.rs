use async_trait::async_trait;
use futures::Stream;
use parley_core::{ChatChunk, GenerationRequest};
use std::pin::Pin;

use crate::error::Result;

/// Stream of chunks produced for one request
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// The generation collaborator: turns role-tagged history into a chunk stream.
///
/// A stream ends normally after its last chunk, or yields an `Err` /
/// `ChatChunk::Error` when generation fails part-way.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model used when the request does not name one
    fn default_model(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<ChatStream>;
}

/// The embedding collaborator
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
