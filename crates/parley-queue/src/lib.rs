//! Job model and task queue.
//!
//! Jobs are a tagged sum type dispatched exhaustively by workers. The
//! [`TaskQueue`] contract mirrors a durable queue: priorities, bounded
//! retries with backoff and bounded retention of finished jobs.

pub mod error;
pub mod job;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::{
    Backoff, CleanupScope, Job, JobHandle, JobId, JobOptions, Lease, TurnRequest,
    CLEANUP_PRIORITY, EMBED_PRIORITY,
};
pub use queue::{InMemoryTaskQueue, JobState, NackOutcome, QueueHealth, QueueStats, TaskQueue};
