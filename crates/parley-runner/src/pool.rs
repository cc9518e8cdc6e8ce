//! Worker pool: N consumers leasing jobs from the task queue.

use std::sync::Arc;
use std::time::Duration;

use parley_config::WorkerConfig;
use parley_core::ServerEvent;
use parley_queue::{CleanupScope, Job, Lease, NackOutcome, TaskQueue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::TurnDispatcher;
use crate::error::RunnerError;
use crate::worker::GenerationWorker;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const LEASE_ERROR_PAUSE: Duration = Duration::from_millis(500);

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    worker: Arc<GenerationWorker>,
    concurrency: usize,
    job_timeout: Duration,
    cleanup: Option<(TurnDispatcher, Duration)>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, worker: Arc<GenerationWorker>, config: &WorkerConfig) -> Self {
        Self {
            queue,
            worker,
            concurrency: config.concurrency.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs.max(1)),
            cleanup: None,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Periodically enqueue a purge of expired fast-tier windows.
    pub fn with_cleanup(mut self, dispatcher: TurnDispatcher) -> Self {
        self.cleanup = Some((dispatcher, DEFAULT_CLEANUP_INTERVAL));
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        if let Some((_, ref mut current)) = self.cleanup {
            *current = interval;
        }
        self
    }

    pub fn start(self) -> PoolHandle {
        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.concurrency + 1);

        for index in 0..self.concurrency {
            let consumer = Consumer {
                index,
                queue: self.queue.clone(),
                worker: self.worker.clone(),
                job_timeout: self.job_timeout,
            };
            tasks.push(tokio::spawn(consumer.run(token.clone())));
        }

        if let Some((dispatcher, interval)) = self.cleanup {
            tasks.push(tokio::spawn(cleanup_ticker(dispatcher, interval, token.clone())));
        }

        info!(
            concurrency = self.concurrency,
            job_timeout_secs = self.job_timeout.as_secs(),
            "Worker pool started"
        );
        PoolHandle { token, tasks }
    }
}

pub struct PoolHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop leasing and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

struct Consumer {
    index: usize,
    queue: Arc<dyn TaskQueue>,
    worker: Arc<GenerationWorker>,
    job_timeout: Duration,
}

impl Consumer {
    async fn run(self, token: CancellationToken) {
        debug!(worker = self.index, "Worker started");
        loop {
            let leased = tokio::select! {
                _ = token.cancelled() => break,
                leased = self.queue.lease() => leased,
            };

            match leased {
                Ok(Some(lease)) => self.handle(lease).await,
                Ok(None) => {
                    debug!(worker = self.index, "Queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker = self.index, "Lease failed: {}", e);
                    tokio::time::sleep(LEASE_ERROR_PAUSE).await;
                }
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    async fn handle(&self, lease: Lease) {
        let result = tokio::time::timeout(self.job_timeout, self.worker.process(&lease)).await;

        let failure = match result {
            Ok(Ok(())) => {
                if let Err(e) = self.queue.ack(&lease.id).await {
                    warn!(job_id = %lease.id, "Ack failed: {}", e);
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                let timeout = RunnerError::Timeout(self.job_timeout);
                // the turn future was dropped mid-stream, so nobody told the room
                if let Job::GenerateResponse(ref turn) = lease.job {
                    if let Err(e) = self
                        .worker
                        .relay()
                        .publish(&turn.session_id, &ServerEvent::turn_failed())
                        .await
                    {
                        warn!("Failed to relay timeout: {}", e);
                    }
                }
                timeout.to_string()
            }
        };

        match self.queue.nack(&lease.id, &failure).await {
            Ok(NackOutcome::Retrying { next_attempt, delay }) => warn!(
                job_id = %lease.id,
                job_type = lease.job.type_name(),
                next_attempt,
                delay_ms = delay.as_millis() as u64,
                "Job failed, will retry: {}",
                failure
            ),
            Ok(NackOutcome::Failed) => error!(
                job_id = %lease.id,
                job_type = lease.job.type_name(),
                attempts = lease.attempt,
                "Job failed permanently: {}",
                failure
            ),
            Err(e) => warn!(job_id = %lease.id, "Nack failed: {}", e),
        }
    }
}

async fn cleanup_ticker(dispatcher: TurnDispatcher, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let job = Job::Cleanup { scope: CleanupScope::ExpiredWindows };
                if let Err(e) = dispatcher.submit_job(job).await {
                    warn!("Failed to schedule cleanup: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use parley_config::{MemoryConfig, QueueConfig};
    use parley_core::{ChatChunk, GenerationRequest, Message, Session};
    use parley_llm::{ChatStream, Generator, HashEmbedder, ScriptedGenerator};
    use parley_memory::TieredMemoryManager;
    use parley_queue::{Backoff, InMemoryTaskQueue, JobOptions, JobState, TurnRequest};
    use parley_relay::{EventSink, InMemoryBroker, Relay};
    use parley_session::{ChatStore, InMemoryChatStore};
    use tokio::sync::mpsc;

    /// Yields one chunk, then never finishes.
    struct StallingGenerator;

    #[async_trait]
    impl Generator for StallingGenerator {
        fn default_model(&self) -> &str {
            "stalling"
        }

        async fn generate(&self, _request: GenerationRequest) -> parley_llm::Result<ChatStream> {
            let first: parley_llm::Result<ChatChunk> = Ok(ChatChunk::content("partial"));
            let head = futures::stream::iter(vec![first]);
            Ok(Box::pin(head.chain(futures::stream::pending())))
        }
    }

    async fn setup(
        generator: impl Generator + 'static,
    ) -> (Arc<InMemoryTaskQueue>, Arc<InMemoryChatStore>, Arc<GenerationWorker>) {
        let store = Arc::new(InMemoryChatStore::new());
        store
            .create_session(&Session::with_id("s1", "alice"))
            .await
            .unwrap();
        let memory = Arc::new(TieredMemoryManager::in_memory(
            &MemoryConfig::default(),
            Arc::new(HashEmbedder::default()),
        ));
        let worker = Arc::new(GenerationWorker::new(
            store.clone(),
            memory,
            Relay::new(Arc::new(InMemoryBroker::default())),
            Arc::new(generator),
        ));
        (Arc::new(InMemoryTaskQueue::new()), store, worker)
    }

    async fn wait_for_state(queue: &InMemoryTaskQueue, id: &str, state: JobState) {
        for _ in 0..200 {
            if queue.state(id).await.unwrap() == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn test_pool_completes_turn() {
        let (queue, store, worker) = setup(ScriptedGenerator::with_text_chunks(&["Hi"])).await;
        let message = Message::user("Hello");
        store.append_message("s1", &message).await.unwrap();

        let handle = WorkerPool::new(queue.clone(), worker, &WorkerConfig::default()).start();
        let job = queue
            .enqueue(
                Job::GenerateResponse(TurnRequest::new("s1", "alice", "Hello", message.id)),
                JobOptions::default(),
            )
            .await
            .unwrap();

        wait_for_state(&queue, &job.id, JobState::Completed).await;
        assert_eq!(store.message_count("s1").await.unwrap(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_turn_is_retried_then_failed() {
        let (queue, store, worker) = setup(ScriptedGenerator::default().failing_to_start()).await;
        let handle = WorkerPool::new(queue.clone(), worker, &WorkerConfig::default()).start();

        let options = JobOptions::default()
            .with_attempts(2)
            .with_backoff(Backoff::Fixed { delay_ms: 10 });
        let job = queue
            .enqueue(
                Job::GenerateResponse(TurnRequest::new("s1", "alice", "Hello", "m1")),
                options,
            )
            .await
            .unwrap();

        wait_for_state(&queue, &job.id, JobState::Failed).await;
        assert!(queue.failure_reason(&job.id).is_some());
        assert_eq!(store.message_count("s1").await.unwrap(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_turn_fails_visibly_and_retries() {
        let (queue, store, worker) = setup(StallingGenerator).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        worker.relay().subscribe("s1", "c1", sink).await.unwrap();

        let message = Message::user("Hello");
        store.append_message("s1", &message).await.unwrap();
        let handle = WorkerPool::new(queue.clone(), worker, &WorkerConfig::default())
            .with_job_timeout(Duration::from_millis(100))
            .start();

        let options = JobOptions::default()
            .with_attempts(2)
            .with_backoff(Backoff::Fixed { delay_ms: 10 });
        let job = queue
            .enqueue(
                Job::GenerateResponse(TurnRequest::new("s1", "alice", "Hello", message.id)),
                options,
            )
            .await
            .unwrap();

        wait_for_state(&queue, &job.id, JobState::Failed).await;
        let reason = queue.failure_reason(&job.id).unwrap();
        assert!(reason.contains("timed out"), "{}", reason);

        // leftover buffered chunks must not trail the final error
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec!["status", "chunk", "error", "status", "chunk", "error"]
        );
        assert_eq!(store.message_count("s1").await.unwrap(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumers() {
        let (queue, _store, worker) = setup(ScriptedGenerator::default()).await;
        let config = WorkerConfig {
            concurrency: 3,
            ..WorkerConfig::default()
        };
        let handle = WorkerPool::new(queue, worker, &config)
            .with_cleanup(TurnDispatcher::new(
                Arc::new(InMemoryTaskQueue::new()),
                QueueConfig::default(),
            ))
            .start();

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown hung");
    }
}
