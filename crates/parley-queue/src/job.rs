//! Job payloads and enqueue options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_config::QueueConfig;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

pub type JobId = String;

/// Priority of history embedding jobs
pub const EMBED_PRIORITY: i32 = 5;
/// Priority of maintenance jobs
pub const CLEANUP_PRIORITY: i32 = 1;

/// One chat turn to be answered by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Assigned by the dispatcher, threads through logs and events
    #[serde(default)]
    pub correlation_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    /// Id of the persisted user message
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl TurnRequest {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: String::new(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            message_id: message_id.into(),
            model_id: None,
            system_prompt: None,
            agent_id: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Shape checks done before a turn is accepted.
    pub fn validate(&self) -> QueueResult<()> {
        let required = [
            ("session_id", &self.session_id),
            ("user_id", &self.user_id),
            ("message_id", &self.message_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidPayload(format!("{} is required", field)));
            }
        }
        if self.message.trim().is_empty() {
            return Err(QueueError::InvalidPayload("message is empty".to_string()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(QueueError::InvalidPayload(format!(
                    "temperature {} outside 0..=2",
                    t
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(QueueError::InvalidPayload("max_tokens must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupScope {
    /// Drop idle fast-tier windows
    ExpiredWindows,
    /// Clear both memory tiers of one session
    SessionMemory { session_id: String },
}

/// Deferred work, dispatched exhaustively by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Job {
    GenerateResponse(TurnRequest),
    EmbedHistory { session_id: String },
    Cleanup { scope: CleanupScope },
}

impl Job {
    pub fn type_name(&self) -> &'static str {
        match self {
            Job::GenerateResponse(_) => "generate_response",
            Job::EmbedHistory { .. } => "embed_history",
            Job::Cleanup { .. } => "cleanup",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Job::GenerateResponse(turn) => Some(turn.session_id.as_str()),
            Job::EmbedHistory { session_id } => Some(session_id.as_str()),
            Job::Cleanup {
                scope: CleanupScope::SessionMemory { session_id },
            } => Some(session_id.as_str()),
            Job::Cleanup { .. } => None,
        }
    }

    /// Priority used when the caller gives none. Turns use the configured
    /// value, background work always ranks below them.
    pub fn default_priority(&self, config: &QueueConfig) -> i32 {
        match self {
            Job::GenerateResponse(_) => config.turn_priority,
            Job::EmbedHistory { .. } => EMBED_PRIORITY,
            Job::Cleanup { .. } => CLEANUP_PRIORITY,
        }
    }
}

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay after the `failed_attempts`-th failure, i.e. before attempt
    /// `failed_attempts + 1`. Exponential gives base, 2*base, 4*base...
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms } => {
                let exponent = failed_attempts.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Higher runs first
    pub priority: i32,
    pub attempts: u32,
    pub backoff: Backoff,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl JobOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            priority: 0,
            attempts: config.default_attempts.max(1),
            backoff: Backoff::Exponential {
                base_ms: config.backoff_base_ms,
            },
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
        }
    }

    /// Options for `job` with its default priority.
    pub fn for_job(job: &Job, config: &QueueConfig) -> Self {
        Self::from_config(config).with_priority(job.default_priority(config))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Returned by enqueue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub job_type: &'static str,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job checked out by one consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: JobId,
    pub job: Job,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Lease {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
