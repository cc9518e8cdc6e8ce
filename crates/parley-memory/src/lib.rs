//! Tiered conversational memory.
//!
//! A bounded, expiring fast tier holds the last messages of each session and
//! a semantic archive holds periodically embedded messages for similarity
//! recall. [`MemoryStrategySelector`] decides which tier a turn reads.

mod archive;
mod error;
mod manager;
mod prompt;
mod strategy;
mod window;

pub use archive::{
    cosine_similarity, ArchiveEntry, InMemoryVectorIndex, ScoredEntry, SemanticArchive, VectorIndex,
};
pub use error::{MemoryError, MemoryResult};
pub use manager::{MemoryContext, MemoryStats, TieredMemoryManager};
pub use prompt::enhance_system_prompt;
pub use strategy::{MemoryStrategy, MemoryStrategySelector};
pub use window::{InMemoryRecentWindow, RecentWindowStore, WindowStats};
