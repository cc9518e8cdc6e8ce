//! Deterministic generators and embedders for tests and offline runs.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{ChatChunk, FinishReason, GenerationRequest};

use crate::error::{LLMError, Result};
use crate::generator::{ChatStream, Embedder, Generator};

/// Replays a fixed list of chunks for every request.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    chunks: Vec<ChatChunk>,
    fail_after: Option<usize>,
    fail_to_start: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(chunks: Vec<ChatChunk>) -> Self {
        Self {
            chunks,
            ..Self::default()
        }
    }

    /// Content chunks followed by a stop marker.
    pub fn with_text_chunks(texts: &[&str]) -> Self {
        let mut chunks: Vec<ChatChunk> = texts.iter().map(|t| ChatChunk::content(*t)).collect();
        chunks.push(ChatChunk::finish(FinishReason::Stop));
        Self::new(chunks)
    }

    /// Yield `n` chunks, then an error.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Reject the request before any chunk is produced.
    pub fn failing_to_start(mut self) -> Self {
        self.fail_to_start = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChatStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        if self.fail_to_start {
            return Err(LLMError::Api {
                status: 503,
                message: "scripted failure".to_string(),
            });
        }

        let mut items: Vec<Result<ChatChunk>> = match self.fail_after {
            Some(n) => self.chunks.iter().take(n).cloned().map(Ok).collect(),
            None => self.chunks.iter().cloned().map(Ok).collect(),
        };
        if self.fail_after.is_some() {
            items.push(Err(LLMError::Stream("scripted stream failure".to_string())));
        }

        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Echoes the latest user message back, word by word.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn default_model(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChatStream> {
        let text = request.last_user_content().unwrap_or_default().to_string();
        let mut items: Vec<Result<ChatChunk>> = text
            .split_inclusive(' ')
            .map(|word| Ok(ChatChunk::content(word)))
            .collect();
        items.push(Ok(ChatChunk::finish(FinishReason::Stop)));
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Feature-hashed bag of words, L2-normalized. Texts sharing words get a
/// positive cosine similarity, which is enough for recall in tests.
#[derive(Debug)]
pub struct HashEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
    failing: bool,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            calls: AtomicUsize::new(0),
            failing: false,
        }
    }

    /// Every call fails, for exercising degraded paths.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(8)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bucket(&self, word: &str) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dimensions as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(LLMError::Network("embedding service unavailable".to_string()));
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[self.bucket(&word.to_lowercase())] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::Message;

    #[tokio::test]
    async fn test_scripted_generator_replays_chunks() {
        let generator = ScriptedGenerator::with_text_chunks(&["Hi", " there!"]);
        let stream = generator.generate(GenerationRequest::new()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].as_ref().unwrap().text(), Some("Hi"));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_generator_failure() {
        let generator = ScriptedGenerator::with_text_chunks(&["a", "b"]).failing_after(1);
        let chunks: Vec<_> = generator
            .generate(GenerationRequest::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }

    #[tokio::test]
    async fn test_echo_generator() {
        let request = GenerationRequest::new().with_message(Message::user("hello big world"));
        let chunks: Vec<_> = EchoGenerator.generate(request).await.unwrap().collect().await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.as_ref().ok().and_then(|c| c.text().map(str::to_string)))
            .collect();
        assert_eq!(text, "hello big world");
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(16);
        let a = embedder.embed("Rust ownership rules").await.unwrap();
        let b = embedder.embed("rust Ownership RULES").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embedder.calls(), 2);

        let empty = embedder.embed("").await.unwrap();
        assert!(empty.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_failing_embedder() {
        let embedder = HashEmbedder::failing();
        assert!(embedder.embed("x").await.is_err());
        assert_eq!(embedder.calls(), 1);
    }
}
