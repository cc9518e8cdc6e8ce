//! Task queue contract and the in-process implementation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_observability::QueueMetrics;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobHandle, JobId, JobOptions, Lease};

const HEALTH_MAX_FAILED: usize = 100;
const HEALTH_MAX_WAITING: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled again after `delay`
    Retrying { next_attempt: u32, delay: Duration },
    /// Attempts exhausted, moved to the failed list
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
}

impl QueueHealth {
    pub fn from_stats(stats: &QueueStats) -> Self {
        let mut issues = Vec::new();
        if stats.failed > HEALTH_MAX_FAILED {
            issues.push(format!("High number of failed jobs: {}", stats.failed));
        }
        if stats.waiting > HEALTH_MAX_WAITING {
            issues.push(format!("High number of waiting jobs: {}", stats.waiting));
        }
        if stats.paused {
            issues.push("Queue is paused".to_string());
        }
        Self {
            healthy: issues.is_empty(),
            issues,
        }
    }
}

/// Durable task queue contract. A leased job is held by exactly one
/// consumer until it is acked or nacked.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: Job, options: JobOptions) -> QueueResult<JobHandle>;

    /// Wait for the next runnable job. `None` once the queue is closed.
    async fn lease(&self) -> QueueResult<Option<Lease>>;

    async fn ack(&self, job_id: &str) -> QueueResult<()>;

    /// Record a failed attempt, scheduling a retry while attempts remain.
    async fn nack(&self, job_id: &str, error: &str) -> QueueResult<NackOutcome>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    async fn health(&self) -> QueueResult<QueueHealth> {
        Ok(QueueHealth::from_stats(&self.stats().await?))
    }

    async fn state(&self, job_id: &str) -> QueueResult<Option<JobState>>;

    /// Stop handing out jobs. Enqueue still works.
    async fn pause(&self) -> QueueResult<()>;

    async fn resume(&self) -> QueueResult<()>;

    /// Put a failed job back with fresh attempts.
    async fn retry(&self, job_id: &str) -> QueueResult<()>;

    /// Drop a job that is not currently active. Returns whether it existed.
    async fn remove(&self, job_id: &str) -> QueueResult<bool>;

    /// Reject new work and wake every waiting consumer.
    async fn close(&self) -> QueueResult<()>;
}

#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    job: Job,
    options: JobOptions,
    state: JobState,
    attempts_made: u32,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then FIFO
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Ready>,
    delayed: Vec<(Instant, JobId)>,
    jobs: HashMap<JobId, JobRecord>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
    seq: u64,
    paused: bool,
    closed: bool,
}

impl QueueState {
    fn push_ready(&mut self, id: JobId, priority: i32) {
        self.seq += 1;
        self.ready.push(Ready {
            priority,
            seq: self.seq,
            id,
        });
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        for (_, id) in due {
            if let Some(record) = self.jobs.get_mut(&id) {
                record.state = JobState::Waiting;
                let priority = record.options.priority;
                self.push_ready(id, priority);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    /// Pop the best ready job that still exists.
    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(ready) = self.ready.pop() {
            let live = self
                .jobs
                .get(&ready.id)
                .map_or(false, |r| r.state == JobState::Waiting);
            if live {
                return Some(ready.id);
            }
        }
        None
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|r| r.state == state).count()
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.count(JobState::Waiting),
            active: self.count(JobState::Active),
            delayed: self.count(JobState::Delayed),
            completed: self.completed.len(),
            failed: self.failed.len(),
            paused: self.paused,
        }
    }

    fn take_active(&mut self, job_id: &str) -> QueueResult<JobRecord> {
        match self.jobs.get(job_id).map(|r| r.state) {
            Some(JobState::Active) => self
                .jobs
                .remove(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string())),
            Some(state) => Err(QueueError::InvalidState {
                id: job_id.to_string(),
                state: state.as_str().to_string(),
                expected: "active",
            }),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }
}

fn retain_last(list: &mut VecDeque<JobRecord>, keep: usize) {
    while list.len() > keep {
        list.pop_front();
    }
}

/// Single-process queue with priorities, delayed retries and bounded
/// retention of finished jobs.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last error of a failed job
    pub fn failure_reason(&self, job_id: &str) -> Option<String> {
        self.state
            .lock()
            .failed
            .iter()
            .find(|r| r.id == job_id)
            .and_then(|r| r.last_error.clone())
    }

    fn try_lease(&self) -> Result<Option<Lease>, Option<Instant>> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        state.promote_due(Instant::now());
        if !state.paused {
            if let Some(id) = state.pop_ready() {
                let waiting = state.count(JobState::Waiting);
                if let Some(record) = state.jobs.get_mut(&id) {
                    record.state = JobState::Active;
                    record.attempts_made += 1;
                    let lease = Lease {
                        id: record.id.clone(),
                        job: record.job.clone(),
                        attempt: record.attempts_made,
                        max_attempts: record.options.attempts,
                    };
                    QueueMetrics::set_waiting(waiting.saturating_sub(1));
                    return Ok(Some(lease));
                }
            }
        }
        Err(state.next_due())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, job: Job, options: JobOptions) -> QueueResult<JobHandle> {
        let job_type = job.type_name();
        let handle = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::unavailable("queue is closed"));
            }

            let id = uuid::Uuid::new_v4().to_string();
            let enqueued_at = Utc::now();
            let priority = options.priority;
            state.jobs.insert(
                id.clone(),
                JobRecord {
                    id: id.clone(),
                    job,
                    options,
                    state: JobState::Waiting,
                    attempts_made: 0,
                    last_error: None,
                    enqueued_at,
                },
            );
            state.push_ready(id.clone(), priority);
            QueueMetrics::set_waiting(state.count(JobState::Waiting));

            JobHandle {
                id,
                job_type,
                priority,
                enqueued_at,
            }
        };

        QueueMetrics::record_enqueued(job_type);
        debug!(job_id = %handle.id, job_type, priority = handle.priority, "Job enqueued");
        self.notify.notify_one();
        Ok(handle)
    }

    async fn lease(&self) -> QueueResult<Option<Lease>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_lease() {
                Ok(lease) => return Ok(lease),
                Err(Some(due)) => {
                    let _ = tokio::time::timeout_at(due, notified).await;
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn ack(&self, job_id: &str) -> QueueResult<()> {
        let job_type = {
            let mut state = self.state.lock();
            let mut record = state.take_active(job_id)?;
            record.state = JobState::Completed;
            let keep = record.options.keep_completed;
            let job_type = record.job.type_name();
            state.completed.push_back(record);
            retain_last(&mut state.completed, keep);
            job_type
        };

        QueueMetrics::record_completed(job_type);
        debug!(job_id, job_type, "Job completed");
        Ok(())
    }

    async fn nack(&self, job_id: &str, error: &str) -> QueueResult<NackOutcome> {
        let mut state = self.state.lock();
        let mut record = state.take_active(job_id)?;
        record.last_error = Some(error.to_string());
        let job_type = record.job.type_name();

        if record.attempts_made < record.options.attempts {
            let delay = record.options.backoff.delay(record.attempts_made);
            let next_attempt = record.attempts_made + 1;
            record.state = JobState::Delayed;
            state.delayed.push((Instant::now() + delay, record.id.clone()));
            state.jobs.insert(record.id.clone(), record);
            drop(state);

            QueueMetrics::record_retried(job_type);
            warn!(job_id, job_type, next_attempt, ?delay, "Job attempt failed, retrying: {}", error);
            self.notify.notify_one();
            return Ok(NackOutcome::Retrying {
                next_attempt,
                delay,
            });
        }

        let attempts = record.attempts_made;
        record.state = JobState::Failed;
        let keep = record.options.keep_failed;
        state.failed.push_back(record);
        retain_last(&mut state.failed, keep);
        drop(state);

        QueueMetrics::record_failed(job_type);
        error!(job_id, job_type, attempts, "Job failed permanently: {}", error);
        Ok(NackOutcome::Failed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.state.lock().stats())
    }

    async fn state(&self, job_id: &str) -> QueueResult<Option<JobState>> {
        let state = self.state.lock();
        if let Some(record) = state.jobs.get(job_id) {
            return Ok(Some(record.state));
        }
        if state.completed.iter().any(|r| r.id == job_id) {
            return Ok(Some(JobState::Completed));
        }
        if state.failed.iter().any(|r| r.id == job_id) {
            return Ok(Some(JobState::Failed));
        }
        Ok(None)
    }

    async fn pause(&self) -> QueueResult<()> {
        self.state.lock().paused = true;
        info!("Queue paused");
        Ok(())
    }

    async fn resume(&self) -> QueueResult<()> {
        self.state.lock().paused = false;
        info!("Queue resumed");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn retry(&self, job_id: &str) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            let position = state
                .failed
                .iter()
                .position(|r| r.id == job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
            let Some(mut record) = state.failed.remove(position) else {
                return Err(QueueError::NotFound(job_id.to_string()));
            };
            record.state = JobState::Waiting;
            record.attempts_made = 0;
            let priority = record.options.priority;
            state.jobs.insert(record.id.clone(), record);
            state.push_ready(job_id.to_string(), priority);
        }

        info!(job_id, "Failed job re-queued");
        self.notify.notify_one();
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock();
        if let Some(record) = state.jobs.get(job_id) {
            if record.state == JobState::Active {
                return Err(QueueError::InvalidState {
                    id: job_id.to_string(),
                    state: record.state.as_str().to_string(),
                    expected: "waiting, delayed or finished",
                });
            }
            state.jobs.remove(job_id);
            state.delayed.retain(|(_, id)| id != job_id);
            return Ok(true);
        }

        let before = state.completed.len() + state.failed.len();
        state.completed.retain(|r| r.id != job_id);
        state.failed.retain(|r| r.id != job_id);
        Ok(state.completed.len() + state.failed.len() < before)
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        info!("Queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Backoff, CleanupScope, TurnRequest};
    use std::sync::Arc;

    fn turn(message: &str) -> Job {
        Job::GenerateResponse(TurnRequest::new("s1", "alice", message, "m1"))
    }

    fn fast_options() -> JobOptions {
        JobOptions::default().with_backoff(Backoff::Fixed { delay_ms: 10 })
    }

    async fn lease_now(queue: &InMemoryTaskQueue) -> Lease {
        tokio::time::timeout(Duration::from_secs(1), queue.lease())
            .await
            .expect("no job leased")
            .unwrap()
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_enqueue_and_lease() {
        let queue = InMemoryTaskQueue::new();
        let handle = queue.enqueue(turn("Hello"), JobOptions::default()).await.unwrap();
        assert_eq!(handle.job_type, "generate_response");

        let lease = lease_now(&queue).await;
        assert_eq!(lease.id, handle.id);
        assert_eq!(lease.attempt, 1);
        assert_eq!(queue.state(&handle.id).await.unwrap(), Some(JobState::Active));

        queue.ack(&handle.id).await.unwrap();
        assert_eq!(queue.state(&handle.id).await.unwrap(), Some(JobState::Completed));
        assert!(matches!(queue.ack(&handle.id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = InMemoryTaskQueue::new();
        let cleanup = Job::Cleanup {
            scope: CleanupScope::ExpiredWindows,
        };
        queue.enqueue(cleanup, JobOptions::default().with_priority(1)).await.unwrap();
        let first = queue.enqueue(turn("a"), JobOptions::default().with_priority(10)).await.unwrap();
        let second = queue.enqueue(turn("b"), JobOptions::default().with_priority(10)).await.unwrap();

        assert_eq!(lease_now(&queue).await.id, first.id);
        assert_eq!(lease_now(&queue).await.id, second.id);
        assert_eq!(lease_now(&queue).await.job.type_name(), "cleanup");
    }

    #[tokio::test]
    async fn test_retry_with_backoff_then_fail() {
        let queue = InMemoryTaskQueue::new();
        let handle = queue
            .enqueue(turn("flaky"), fast_options().with_attempts(2))
            .await
            .unwrap();

        let lease = lease_now(&queue).await;
        let outcome = queue.nack(&lease.id, "boom").await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                next_attempt: 2,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        let lease = lease_now(&queue).await;
        assert_eq!(lease.attempt, 2);
        assert!(lease.is_last_attempt());
        assert_eq!(queue.nack(&lease.id, "boom again").await.unwrap(), NackOutcome::Failed);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting + stats.delayed + stats.active, 0);
        assert_eq!(queue.failure_reason(&handle.id).as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_manual_retry_of_failed_job() {
        let queue = InMemoryTaskQueue::new();
        let handle = queue.enqueue(turn("x"), fast_options().with_attempts(1)).await.unwrap();
        let lease = lease_now(&queue).await;
        queue.nack(&lease.id, "nope").await.unwrap();

        queue.retry(&handle.id).await.unwrap();
        let lease = lease_now(&queue).await;
        assert_eq!(lease.id, handle.id);
        assert_eq!(lease.attempt, 1);
        assert!(queue.retry("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_retention_caps() {
        let queue = InMemoryTaskQueue::new();
        let mut options = JobOptions::default();
        options.keep_completed = 2;

        for i in 0..5 {
            queue.enqueue(turn(&format!("m{}", i)), options.clone()).await.unwrap();
            let lease = lease_now(&queue).await;
            queue.ack(&lease.id).await.unwrap();
        }
        assert_eq!(queue.stats().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        queue.pause().await.unwrap();
        queue.enqueue(turn("held"), JobOptions::default()).await.unwrap();

        let health = queue.health().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.issues, vec!["Queue is paused".to_string()]);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.resume().await.unwrap();
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(lease.is_some());
        assert!(queue.health().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_close_wakes_consumers_and_rejects_work() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close().await.unwrap();
        let leased = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(leased.is_none());

        let err = queue.enqueue(turn("late"), JobOptions::default()).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_remove() {
        let queue = InMemoryTaskQueue::new();
        let waiting = queue.enqueue(turn("a"), JobOptions::default()).await.unwrap();
        assert!(queue.remove(&waiting.id).await.unwrap());
        assert!(!queue.remove(&waiting.id).await.unwrap());

        let active = queue.enqueue(turn("b"), JobOptions::default()).await.unwrap();
        let lease = lease_now(&queue).await;
        assert_eq!(lease.id, active.id);
        assert!(queue.remove(&active.id).await.is_err());
    }

    #[test]
    fn test_health_thresholds() {
        let stats = QueueStats {
            failed: 101,
            waiting: 1001,
            ..QueueStats::default()
        };
        let health = QueueHealth::from_stats(&stats);
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 2);
    }
}
