//! Turn execution for parley.
//!
//! The dispatcher validates and enqueues turns, the pool leases them and
//! the generation worker assembles memory context, streams the reply
//! through the relay and persists it.

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod worker;

pub use agent::{chunk_words, AgentExecutor, AgentOutcome, AgentRequest, GeneratorAgent, AGENT_CHUNK_WORDS};
pub use dispatcher::TurnDispatcher;
pub use error::{RunnerError, RunnerResult};
pub use pool::{PoolHandle, WorkerPool};
pub use worker::{GenerationWorker, TurnOutcome, TurnPhase, WorkerSettings, DEFAULT_SYSTEM_PROMPT};
