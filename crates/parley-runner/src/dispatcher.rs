//! Turn dispatcher: validates a turn and hands it to the task queue.
//! It never waits on generation.

use std::sync::Arc;

use parley_config::QueueConfig;
use parley_queue::{Job, JobHandle, JobOptions, TaskQueue, TurnRequest};
use tracing::{error, info};

use crate::error::{RunnerError, RunnerResult};

#[derive(Clone)]
pub struct TurnDispatcher {
    queue: Arc<dyn TaskQueue>,
    config: QueueConfig,
}

impl std::fmt::Debug for TurnDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnDispatcher")
            .field("config", &self.config)
            .finish()
    }
}

impl TurnDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, config: QueueConfig) -> Self {
        Self { queue, config }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Enqueue a chat turn. A correlation id is assigned when the request
    /// has none. Any enqueue failure is reported as `QueueUnavailable`.
    pub async fn submit(&self, mut turn: TurnRequest) -> RunnerResult<JobHandle> {
        turn.validate()
            .map_err(|e| RunnerError::InvalidRequest(e.to_string()))?;

        if turn.correlation_id.is_empty() {
            turn.correlation_id = uuid::Uuid::new_v4().to_string();
        }
        let session_id = turn.session_id.clone();
        let correlation_id = turn.correlation_id.clone();

        let handle = self.enqueue(Job::GenerateResponse(turn)).await?;
        info!(
            session_id = %session_id,
            correlation_id = %correlation_id,
            job_id = %handle.id,
            "Turn dispatched"
        );
        Ok(handle)
    }

    /// Enqueue background work with its default priority.
    pub async fn submit_job(&self, job: Job) -> RunnerResult<JobHandle> {
        self.enqueue(job).await
    }

    async fn enqueue(&self, job: Job) -> RunnerResult<JobHandle> {
        let job_type = job.type_name();
        let options = JobOptions::for_job(&job, &self.config);
        self.queue.enqueue(job, options).await.map_err(|e| {
            error!(job_type, "Failed to enqueue job: {}", e);
            RunnerError::QueueUnavailable(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_queue::{
        InMemoryTaskQueue, JobState, Lease, NackOutcome, QueueError, QueueResult, QueueStats,
    };

    /// Queue whose every operation fails
    struct DownQueue;

    #[async_trait]
    impl TaskQueue for DownQueue {
        async fn enqueue(&self, _job: Job, _options: JobOptions) -> QueueResult<JobHandle> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn lease(&self) -> QueueResult<Option<Lease>> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn ack(&self, _job_id: &str) -> QueueResult<()> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn nack(&self, _job_id: &str, _error: &str) -> QueueResult<NackOutcome> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn stats(&self) -> QueueResult<QueueStats> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn state(&self, _job_id: &str) -> QueueResult<Option<JobState>> {
            Err(QueueError::unavailable("connection refused"))
        }
        async fn pause(&self) -> QueueResult<()> {
            Ok(())
        }
        async fn resume(&self) -> QueueResult<()> {
            Ok(())
        }
        async fn retry(&self, _job_id: &str) -> QueueResult<()> {
            Ok(())
        }
        async fn remove(&self, _job_id: &str) -> QueueResult<bool> {
            Ok(false)
        }
        async fn close(&self) -> QueueResult<()> {
            Ok(())
        }
    }

    fn turn() -> TurnRequest {
        TurnRequest::new("s1", "alice", "Hello", "m1")
    }

    #[tokio::test]
    async fn test_submit_enqueues_with_turn_priority() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let dispatcher = TurnDispatcher::new(queue.clone(), QueueConfig::default());

        let handle = dispatcher.submit(turn()).await.unwrap();
        assert_eq!(handle.job_type, "generate_response");
        assert_eq!(handle.priority, 10);

        let lease = queue.lease().await.unwrap().unwrap();
        match lease.job {
            Job::GenerateResponse(turn) => assert!(!turn.correlation_id.is_empty()),
            other => panic!("unexpected job {:?}", other),
        }
        assert_eq!(lease.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_keeps_given_correlation_id() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let dispatcher = TurnDispatcher::new(queue.clone(), QueueConfig::default());
        let mut request = turn();
        request.correlation_id = "corr-1".to_string();

        dispatcher.submit(request).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();
        assert!(matches!(lease.job, Job::GenerateResponse(ref t) if t.correlation_id == "corr-1"));
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_queue_unavailable() {
        let dispatcher = TurnDispatcher::new(Arc::new(DownQueue), QueueConfig::default());
        assert!(matches!(
            dispatcher.submit(turn()).await,
            Err(RunnerError::QueueUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_turn_is_not_enqueued() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let dispatcher = TurnDispatcher::new(queue.clone(), QueueConfig::default());

        let result = dispatcher.submit(TurnRequest::new("s1", "alice", "", "m1")).await;
        assert!(matches!(result, Err(RunnerError::InvalidRequest(_))));
        assert_eq!(queue.stats().await.unwrap().waiting, 0);
    }
}
