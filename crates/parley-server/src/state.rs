//! Shared application state: wires storage, memory, queue, relay and gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parley_config::{Config, StorageType};
use parley_gateway::{Gateway, RoomManager};
use parley_llm::{
    EchoGenerator, Embedder, Generator, HashEmbedder, OpenAiClient, OpenAiConfig, OpenAiEmbedder,
    OpenAiGenerator,
};
use parley_memory::TieredMemoryManager;
use parley_queue::{InMemoryTaskQueue, TaskQueue};
use parley_relay::{InMemoryBroker, Relay};
use parley_runner::{GenerationWorker, GeneratorAgent, TurnDispatcher, WorkerPool, WorkerSettings};
use parley_session::{ChatStore, InMemoryChatStore, JsonlChatStore, JsonlStoreConfig};
use tracing::{info, warn};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ChatStore>,
    pub memory: Arc<TieredMemoryManager>,
    pub relay: Relay,
    pub queue: Arc<dyn TaskQueue>,
    pub dispatcher: TurnDispatcher,
    pub worker: Arc<GenerationWorker>,
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store = build_store(&config).await?;
        let (generator, embedder) = build_llm(&config)?;

        let memory = Arc::new(TieredMemoryManager::in_memory(&config.memory, embedder));
        let relay = Relay::new(Arc::new(InMemoryBroker::default()));
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        let dispatcher = TurnDispatcher::new(queue.clone(), config.queue.clone());

        let worker = GenerationWorker::new(store.clone(), memory.clone(), relay.clone(), generator.clone())
            .with_agent(Arc::new(GeneratorAgent::new(generator)))
            .with_dispatcher(dispatcher.clone())
            .with_settings(WorkerSettings::from_config(&config.worker));

        let rooms = Arc::new(RoomManager::new(
            store.clone(),
            relay.clone(),
            dispatcher.clone(),
            memory.clone(),
        ));

        Ok(Self {
            config,
            store,
            memory,
            relay,
            queue,
            dispatcher,
            worker: Arc::new(worker),
            rooms,
        })
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.config.gateway.clone(), self.rooms.clone())
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(self.queue.clone(), self.worker.clone(), &self.config.worker)
            .with_cleanup(self.dispatcher.clone())
    }

    /// Stop accepting jobs and close relay listeners.
    pub async fn shutdown(&self) {
        if let Err(e) = self.queue.close().await {
            warn!("Failed to close queue: {}", e);
        }
        self.relay.shutdown();

        if let Ok(stats) = self.queue.stats().await {
            info!(
                waiting = stats.waiting,
                failed = stats.failed,
                "Queue closed"
            );
        }
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ChatStore>> {
    match config.storage.storage_type {
        StorageType::Memory => {
            warn!("Using in-memory chat store, history is lost on restart");
            Ok(Arc::new(InMemoryChatStore::new()))
        }
        StorageType::Jsonl => {
            let path = config
                .storage
                .path
                .as_deref()
                .and_then(parley_config::expand_tilde)
                .unwrap_or_else(parley_session::default_storage_path);
            info!("Chat store at {:?}", path);
            let store = JsonlChatStore::new(JsonlStoreConfig::new(path))
                .await
                .context("failed to open JSONL chat store")?;
            Ok(Arc::new(store))
        }
    }
}

fn build_llm(config: &Config) -> anyhow::Result<(Arc<dyn Generator>, Arc<dyn Embedder>)> {
    let llm = &config.llm;
    let Some(api_key) = llm.api_key() else {
        warn!(
            "{} is not set, falling back to the offline echo generator",
            llm.api_key_env
        );
        return Ok((Arc::new(EchoGenerator), Arc::new(HashEmbedder::default())));
    };

    let client = OpenAiClient::new(
        OpenAiConfig::new(&llm.base_url)
            .with_api_key(api_key)
            .with_model(&llm.model)
            .with_embedding_model(&llm.embedding_model)
            .with_timeout(Duration::from_secs(llm.timeout_seconds))
            .with_headers(llm.headers.clone()),
    )
    .context("failed to build LLM client")?;

    info!(base_url = %llm.base_url, model = %llm.model, "LLM client ready");
    Ok((
        Arc::new(OpenAiGenerator::new(client.clone())),
        Arc::new(OpenAiEmbedder::new(client)),
    ))
}
