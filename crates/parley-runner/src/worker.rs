//! Generation worker.
//!
//! Per turn: received, context assembly, generating (or tool use for agent
//! turns), finalizing, then done or failed. Chunks go through an mpsc
//! channel to a forwarding task that publishes them in arrival order; the
//! `end` event is published only after that task has drained.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parley_config::WorkerConfig;
use parley_core::{
    ChatChunk, GenerationOptions, GenerationRequest, Message, ServerEvent, TokenUsage, TurnStatus,
};
use parley_llm::Generator;
use parley_memory::{enhance_system_prompt, MemoryStrategy, TieredMemoryManager};
use parley_observability::{turn_span, TurnMetrics};
use parley_queue::{CleanupScope, Job, Lease, TurnRequest};
use parley_relay::Relay;
use parley_session::ChatStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::agent::{chunk_words, AgentExecutor, AgentRequest, AGENT_CHUNK_WORDS};
use crate::dispatcher::TurnDispatcher;
use crate::error::{RunnerError, RunnerResult};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Messages of history sent along with a plain turn
const HISTORY_LIMIT: usize = 10;

const CHUNK_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Received,
    ContextAssembly,
    Generating,
    ToolUse,
    Finalizing,
    Done,
    Failed,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Received => "received",
            TurnPhase::ContextAssembly => "context_assembly",
            TurnPhase::Generating => "generating",
            TurnPhase::ToolUse => "tool_use",
            TurnPhase::Finalizing => "finalizing",
            TurnPhase::Done => "done",
            TurnPhase::Failed => "failed",
        }
    }
}

/// Result of a finished turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub message_id: String,
    pub content: String,
    pub usage: TokenUsage,
    pub chunks: usize,
    pub phases: Vec<TurnPhase>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub system_prompt: String,
    /// Re-chunk agent responses into word groups
    pub stream_agent_responses: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            stream_agent_responses: config.stream_agent_responses,
        }
    }
}

struct TurnContext {
    conversation: Vec<Message>,
    system_prompt: String,
}

/// Chunk producer side of a turn. Closing the sender ends the forwarder,
/// dropping it unfinished aborts the task.
struct ChunkForwarder {
    tx: Option<mpsc::Sender<ServerEvent>>,
    task: JoinHandle<usize>,
}

impl ChunkForwarder {
    fn spawn(relay: Relay, session_id: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<ServerEvent>(CHUNK_BUFFER);
        let task = tokio::spawn(async move {
            let mut forwarded = 0;
            while let Some(event) = rx.recv().await {
                if let Err(e) = relay.publish(&session_id, &event).await {
                    warn!(session_id = %session_id, "Chunk relay failed: {}", e);
                }
                forwarded += 1;
            }
            forwarded
        });
        Self { tx: Some(tx), task }
    }

    async fn send(&self, content: String) -> RunnerResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RunnerError::generation("chunk forwarder closed"))?;
        tx.send(ServerEvent::chunk(content))
            .await
            .map_err(|_| RunnerError::generation("chunk forwarder stopped"))
    }

    /// Close the channel and wait until every chunk has been published.
    async fn finish(mut self) -> usize {
        self.tx.take();
        match (&mut self.task).await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                warn!("Chunk forwarder task failed: {}", e);
                0
            }
        }
    }
}

impl Drop for ChunkForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct GenerationWorker {
    store: Arc<dyn ChatStore>,
    memory: Arc<TieredMemoryManager>,
    relay: Relay,
    generator: Arc<dyn Generator>,
    agent: Option<Arc<dyn AgentExecutor>>,
    dispatcher: Option<TurnDispatcher>,
    settings: WorkerSettings,
}

impl std::fmt::Debug for GenerationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationWorker")
            .field("model", &self.generator.default_model())
            .field("has_agent", &self.agent.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl GenerationWorker {
    pub fn new(
        store: Arc<dyn ChatStore>,
        memory: Arc<TieredMemoryManager>,
        relay: Relay,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            store,
            memory,
            relay,
            generator,
            agent: None,
            dispatcher: None,
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentExecutor>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Lets the worker schedule history embedding after archive checkpoints.
    pub fn with_dispatcher(mut self, dispatcher: TurnDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Run one leased job.
    pub async fn process(&self, lease: &Lease) -> RunnerResult<()> {
        match &lease.job {
            Job::GenerateResponse(turn) => {
                let span = turn_span(&turn.session_id, &lease.id);
                self.process_turn(turn).instrument(span).await.map(|_| ())
            }
            Job::EmbedHistory { session_id } => {
                let history = self.store.history(session_id, None).await?;
                self.memory.embed_history(session_id, &history).await?;
                Ok(())
            }
            Job::Cleanup { scope } => {
                match scope {
                    CleanupScope::ExpiredWindows => {
                        let purged = self.memory.purge_expired().await?;
                        debug!(purged, "Purged expired memory windows");
                    }
                    CleanupScope::SessionMemory { session_id } => {
                        self.memory.clear(session_id).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Produce the assistant reply for one turn. On failure a user-safe
    /// `error` event is published and the error is returned so the queue
    /// can retry.
    pub async fn process_turn(&self, turn: &TurnRequest) -> RunnerResult<TurnOutcome> {
        let started = Instant::now();
        let mut phases = vec![TurnPhase::Received];
        info!(correlation_id = %turn.correlation_id, "Processing turn");

        match self.run_turn(turn, &mut phases).await {
            Ok(mut outcome) => {
                phases.push(TurnPhase::Done);
                outcome.phases = phases;
                TurnMetrics::record_completed(started.elapsed().as_secs_f64());
                info!(
                    correlation_id = %turn.correlation_id,
                    chunks = outcome.chunks,
                    total_tokens = outcome.usage.total_tokens,
                    "Turn completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                TurnMetrics::record_failed();
                error!(
                    correlation_id = %turn.correlation_id,
                    phase = phases.last().map(|p| p.as_str()).unwrap_or("received"),
                    "Turn failed: {}",
                    e
                );
                phases.push(TurnPhase::Failed);
                self.emit(&turn.session_id, &ServerEvent::turn_failed()).await;
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        turn: &TurnRequest,
        phases: &mut Vec<TurnPhase>,
    ) -> RunnerResult<TurnOutcome> {
        phases.push(TurnPhase::ContextAssembly);
        let context = self.assemble_context(turn).await?;

        let (content, reported_usage, chunks) = match turn.agent_id.as_deref() {
            Some(agent_id) => {
                phases.push(TurnPhase::ToolUse);
                self.run_agent(turn, agent_id, context).await?
            }
            None => {
                phases.push(TurnPhase::Generating);
                self.run_generation(turn, context).await?
            }
        };

        phases.push(TurnPhase::Finalizing);
        self.finalize(turn, content, reported_usage, chunks).await
    }

    async fn assemble_context(&self, turn: &TurnRequest) -> RunnerResult<TurnContext> {
        let session_id = &turn.session_id;
        if self.store.get_session(session_id).await?.is_none() {
            return Err(RunnerError::SessionNotFound(session_id.clone()));
        }

        let message_count = self.store.message_count(session_id).await?;
        let history = self.store.history(session_id, Some(HISTORY_LIMIT)).await?;

        if let Err(e) = self.memory.restore_from_history(session_id, &history).await {
            warn!("Fast tier restore failed: {}", e);
        }

        let memory = self
            .memory
            .get_context(session_id, &turn.message, message_count)
            .await?;

        let mut system_prompt = turn
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.settings.system_prompt.clone());

        // a window shorter than the persisted tail lost earlier turns
        let mut conversation = match memory.strategy {
            Some(MemoryStrategy::RecentWindow)
                if memory.messages.len() >= history.len().min(self.memory.window_size()) =>
            {
                memory.messages.clone()
            }
            _ => history,
        };
        if memory.is_recall() {
            system_prompt = enhance_system_prompt(&system_prompt, &memory.messages);
        }

        let ends_with_turn = conversation
            .last()
            .map_or(false, |m| m.id == turn.message_id);
        if !ends_with_turn {
            conversation.push(Message::user(turn.message.clone()).with_id(turn.message_id.clone()));
        }

        debug!(
            message_count,
            strategy = ?memory.strategy,
            context_messages = conversation.len(),
            "Context assembled"
        );
        Ok(TurnContext {
            conversation,
            system_prompt,
        })
    }

    async fn run_generation(
        &self,
        turn: &TurnRequest,
        context: TurnContext,
    ) -> RunnerResult<(String, Option<TokenUsage>, usize)> {
        self.emit(&turn.session_id, &ServerEvent::status(TurnStatus::Generating))
            .await;

        let mut options = GenerationOptions::default();
        if let Some(t) = turn.temperature {
            options = options.with_temperature(t);
        }
        if let Some(max) = turn.max_tokens {
            options = options.with_max_tokens(max);
        }
        let mut request = GenerationRequest::new()
            .with_system_prompt(context.system_prompt)
            .with_messages(context.conversation)
            .with_options(options);
        if let Some(ref model) = turn.model_id {
            request = request.with_model(model.clone());
        }

        let mut stream = self.generator.generate(request).await?;
        let forwarder = ChunkForwarder::spawn(self.relay.clone(), turn.session_id.clone());

        let mut buffer = String::new();
        let mut usage = None;
        let mut failure = None;
        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    failure = Some(RunnerError::from(e));
                    break;
                }
            };
            match chunk {
                ChatChunk::Content { text } if !text.is_empty() => {
                    buffer.push_str(&text);
                    if let Err(e) = forwarder.send(text).await {
                        failure = Some(e);
                        break;
                    }
                }
                ChatChunk::Usage {
                    input_tokens,
                    output_tokens,
                } => usage = Some(TokenUsage::new(input_tokens, output_tokens)),
                ChatChunk::Error { message } => {
                    failure = Some(RunnerError::Generation(message));
                    break;
                }
                ChatChunk::Finish { reason } => debug!(reason = %reason, "Generation finished"),
                _ => {}
            }
        }

        // chunks already produced are published before any error or end event
        let chunks = forwarder.finish().await;
        match failure {
            Some(e) => Err(e),
            None => Ok((buffer, usage, chunks)),
        }
    }

    async fn run_agent(
        &self,
        turn: &TurnRequest,
        agent_id: &str,
        context: TurnContext,
    ) -> RunnerResult<(String, Option<TokenUsage>, usize)> {
        let agent = self
            .agent
            .clone()
            .ok_or_else(|| RunnerError::agent(format!("no executor for agent {}", agent_id)))?;

        self.emit(&turn.session_id, &ServerEvent::status(TurnStatus::Thinking))
            .await;

        let outcome = agent
            .execute(AgentRequest {
                agent_id: agent_id.to_string(),
                session_id: turn.session_id.clone(),
                user_id: turn.user_id.clone(),
                message: turn.message.clone(),
                context: context.conversation,
                system_prompt: Some(context.system_prompt),
            })
            .await?;

        if !outcome.tools_used.is_empty() {
            let event = ServerEvent::ToolsUsed {
                message: format!("Used tools: {}", outcome.tools_used.join(", ")),
                tools: outcome.tools_used.clone(),
            };
            self.emit(&turn.session_id, &event).await;
        }

        let pieces = if self.settings.stream_agent_responses {
            chunk_words(&outcome.response, AGENT_CHUNK_WORDS)
        } else {
            vec![outcome.response.clone()]
        };

        let forwarder = ChunkForwarder::spawn(self.relay.clone(), turn.session_id.clone());
        let mut failure = None;
        for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
            if let Err(e) = forwarder.send(piece).await {
                failure = Some(e);
                break;
            }
        }
        let chunks = forwarder.finish().await;
        match failure {
            Some(e) => Err(e),
            None => Ok((outcome.response, outcome.usage, chunks)),
        }
    }

    async fn finalize(
        &self,
        turn: &TurnRequest,
        content: String,
        reported_usage: Option<TokenUsage>,
        chunks: usize,
    ) -> RunnerResult<TurnOutcome> {
        let session_id = &turn.session_id;
        let reply = Message::assistant(content.clone());
        let count = self.store.append_message(session_id, &reply).await?;

        if let Err(e) = self.memory.add_message(session_id, &reply, count).await {
            warn!("Failed to mirror reply into memory: {}", e);
        }

        let usage = reported_usage.unwrap_or_else(|| TokenUsage::estimate(&turn.message, &content));
        TurnMetrics::record_tokens(usage.prompt_tokens as u64, usage.completion_tokens as u64);

        self.emit(session_id, &ServerEvent::TokenUsage(usage)).await;
        self.emit(
            session_id,
            &ServerEvent::End {
                message_id: Some(reply.id.clone()),
                usage,
            },
        )
        .await;

        if self.memory.selector().should_archive(count) {
            self.schedule_embedding(session_id).await;
        }

        Ok(TurnOutcome {
            message_id: reply.id,
            content,
            usage,
            chunks,
            phases: Vec::new(),
        })
    }

    async fn schedule_embedding(&self, session_id: &str) {
        let Some(ref dispatcher) = self.dispatcher else {
            return;
        };
        let job = Job::EmbedHistory {
            session_id: session_id.to_string(),
        };
        if let Err(e) = dispatcher.submit_job(job).await {
            warn!("Could not schedule history embedding: {}", e);
        }
    }

    /// Best-effort publish; broker failures are logged, never retried.
    async fn emit(&self, session_id: &str, event: &ServerEvent) {
        if let Err(e) = self.relay.publish(session_id, event).await {
            warn!(kind = event.kind(), "Failed to relay event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_config::MemoryConfig;
    use parley_core::{FinishReason, Session};
    use parley_llm::{HashEmbedder, ScriptedGenerator};
    use parley_relay::{EventSink, InMemoryBroker};
    use parley_session::InMemoryChatStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryChatStore>,
        memory: Arc<TieredMemoryManager>,
        relay: Relay,
        embedder: Arc<HashEmbedder>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(InMemoryChatStore::new());
            store
                .create_session(&Session::with_id("s1", "alice"))
                .await
                .unwrap();
            let embedder = Arc::new(HashEmbedder::default());
            Self {
                store,
                memory: Arc::new(TieredMemoryManager::in_memory(
                    &MemoryConfig::default(),
                    embedder.clone(),
                )),
                relay: Relay::new(Arc::new(InMemoryBroker::default())),
                embedder,
            }
        }

        fn worker(&self, generator: Arc<dyn Generator>) -> GenerationWorker {
            GenerationWorker::new(
                self.store.clone(),
                self.memory.clone(),
                self.relay.clone(),
                generator,
            )
        }

        async fn listen(&self, connection_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink: Arc<dyn EventSink> = Arc::new(tx);
            self.relay.subscribe("s1", connection_id, sink).await.unwrap();
            rx
        }

        async fn user_says(&self, text: &str) -> TurnRequest {
            let message = Message::user(text);
            self.store.append_message("s1", &message).await.unwrap();
            TurnRequest::new("s1", "alice", text, message.id)
        }
    }

    async fn collect_until_terminal(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_plain_turn_streams_and_persists() {
        let fixture = Fixture::new().await;
        let mut rx = fixture.listen("c1").await;
        let generator = Arc::new(ScriptedGenerator::with_text_chunks(&["Hi", " there!"]));
        let worker = fixture.worker(generator.clone());

        let turn = fixture.user_says("Hello").await;
        let outcome = worker.process_turn(&turn).await.unwrap();
        assert_eq!(outcome.content, "Hi there!");
        assert_eq!(outcome.chunks, 2);
        assert_eq!(
            outcome.phases,
            vec![
                TurnPhase::Received,
                TurnPhase::ContextAssembly,
                TurnPhase::Generating,
                TurnPhase::Finalizing,
                TurnPhase::Done
            ]
        );

        let events = collect_until_terminal(&mut rx).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["status", "chunk", "chunk", "token_usage", "end"]);
        assert_eq!(events[1], ServerEvent::chunk("Hi"));

        let history = fixture.store.history("s1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hi there!");

        let request = &generator.requests()[0];
        assert_eq!(request.system_prompt.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(request.last_user_content(), Some("Hello"));
        assert_eq!(fixture.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_reported_usage_wins_over_estimate() {
        let fixture = Fixture::new().await;
        let generator = Arc::new(ScriptedGenerator::new(vec![
            ChatChunk::content("ok"),
            ChatChunk::usage(7, 1),
            ChatChunk::finish(FinishReason::Stop),
        ]));
        let turn = fixture.user_says("hey").await;

        let outcome = fixture.worker(generator).process_turn(&turn).await.unwrap();
        assert_eq!(outcome.usage, TokenUsage::new(7, 1));
    }

    #[tokio::test]
    async fn test_stream_error_publishes_error_and_persists_nothing() {
        let fixture = Fixture::new().await;
        let mut rx = fixture.listen("c1").await;
        let generator = Arc::new(ScriptedGenerator::with_text_chunks(&["partial", "never"]).failing_after(1));
        let turn = fixture.user_says("Hello").await;

        let result = fixture.worker(generator).process_turn(&turn).await;
        assert!(matches!(result, Err(RunnerError::Generation(_))));

        let events = collect_until_terminal(&mut rx).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["status", "chunk", "error"]);
        assert_eq!(events[2], ServerEvent::turn_failed());
        assert_eq!(fixture.store.message_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_fails_visibly() {
        let fixture = Fixture::new().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        fixture.relay.subscribe("ghost", "c1", sink).await.unwrap();

        let worker = fixture.worker(Arc::new(ScriptedGenerator::with_text_chunks(&["x"])));
        let turn = TurnRequest::new("ghost", "alice", "Hello", "m1");
        assert!(matches!(
            worker.process_turn(&turn).await,
            Err(RunnerError::SessionNotFound(_))
        ));
        assert_eq!(collect_until_terminal(&mut rx).await, vec![ServerEvent::turn_failed()]);
    }

    #[tokio::test]
    async fn test_recall_is_added_to_system_prompt() {
        let fixture = Fixture::new().await;
        for i in 0..60 {
            let text = if i == 9 {
                "my dog is named Pixel".to_string()
            } else {
                format!("filler {}", i)
            };
            let message = Message::user(text);
            let count = fixture.store.append_message("s1", &message).await.unwrap();
            fixture.memory.add_message("s1", &message, count).await.unwrap();
        }
        let turn = fixture.user_says("what is my dog named").await;
        let generator = Arc::new(ScriptedGenerator::with_text_chunks(&["Pixel"]));

        fixture.worker(generator.clone()).process_turn(&turn).await.unwrap();

        let prompt = generator.requests()[0].system_prompt.clone().unwrap();
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(prompt.contains("\n\nRelevant past context:\n- my dog is named Pixel"));
    }

    #[tokio::test]
    async fn test_partial_window_falls_back_to_history() {
        let fixture = Fixture::new().await;
        for i in 0..14 {
            let message = Message::user(format!("earlier {}", i));
            fixture.store.append_message("s1", &message).await.unwrap();
        }
        // memory came up empty and only saw the new message
        let message = Message::user("and now?");
        let count = fixture.store.append_message("s1", &message).await.unwrap();
        fixture.memory.add_message("s1", &message, count).await.unwrap();
        let turn = TurnRequest::new("s1", "alice", "and now?", message.id);

        let generator = Arc::new(ScriptedGenerator::with_text_chunks(&["ok"]));
        fixture.worker(generator.clone()).process_turn(&turn).await.unwrap();

        let messages = &generator.requests()[0].messages;
        assert_eq!(messages.len(), 10);
        assert_eq!(messages[0].content, "earlier 5");
        assert_eq!(messages[9].content, "and now?");
    }

    #[tokio::test]
    async fn test_dropped_forwarder_publishes_nothing_more() {
        let fixture = Fixture::new().await;
        let mut rx = fixture.listen("c1").await;

        let forwarder = ChunkForwarder::spawn(fixture.relay.clone(), "s1".to_string());
        forwarder.send("a".to_string()).await.unwrap();
        forwarder.send("b".to_string()).await.unwrap();
        drop(forwarder);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_job_purges_windows() {
        let fixture = Fixture::new().await;
        let worker = fixture.worker(Arc::new(ScriptedGenerator::default()));
        fixture.memory.add_message("s1", &Message::user("x"), 1).await.unwrap();

        let lease = Lease {
            id: "j1".to_string(),
            job: Job::Cleanup {
                scope: CleanupScope::SessionMemory {
                    session_id: "s1".to_string(),
                },
            },
            attempt: 1,
            max_attempts: 1,
        };
        worker.process(&lease).await.unwrap();
        assert_eq!(fixture.memory.stats().await.unwrap().window_messages, 0);
    }
}
