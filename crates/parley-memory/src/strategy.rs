//! Which memory tier a turn reads from, decided by the session's message count.

use parley_config::MemoryConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    /// No retrieval augmentation
    Basic,
    /// Fast tier, most recent messages as-is
    RecentWindow,
    /// Similarity recall from the archive
    Semantic,
}

impl MemoryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStrategy::Basic => "basic",
            MemoryStrategy::RecentWindow => "recent_window",
            MemoryStrategy::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for MemoryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only place that knows the tier thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStrategySelector {
    recent_min: usize,
    semantic_min: usize,
    embed_every: usize,
}

impl Default for MemoryStrategySelector {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

impl MemoryStrategySelector {
    pub fn new(recent_min: usize, semantic_min: usize, embed_every: usize) -> Self {
        Self {
            recent_min,
            semantic_min: semantic_min.max(recent_min),
            embed_every: embed_every.max(1),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.recent_strategy_min,
            config.semantic_strategy_min,
            config.embed_threshold,
        )
    }

    /// Strategy for a session holding `message_count` messages.
    pub fn select(&self, message_count: usize) -> MemoryStrategy {
        if message_count > self.semantic_min {
            MemoryStrategy::Semantic
        } else if message_count > self.recent_min {
            MemoryStrategy::RecentWindow
        } else {
            MemoryStrategy::Basic
        }
    }

    /// Whether the message that brought the count to `message_count` is archived.
    pub fn should_archive(&self, message_count: usize) -> bool {
        message_count > 0 && message_count % self.embed_every == 0
    }

    pub fn uses_recall(&self, message_count: usize) -> bool {
        self.select(message_count) == MemoryStrategy::Semantic
    }
}
