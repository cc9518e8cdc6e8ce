use std::sync::Arc;

use parley_config::{MemoryConfig, QueueConfig};
use parley_core::{Message, Role, ServerEvent, Session};
use parley_gateway::{ConnectionHandle, RoomManager};
use parley_llm::{HashEmbedder, ScriptedGenerator};
use parley_memory::TieredMemoryManager;
use parley_queue::{InMemoryTaskQueue, Job, TaskQueue};
use parley_relay::{InMemoryBroker, Relay};
use parley_runner::{GenerationWorker, TurnDispatcher};
use parley_session::{ChatStore, InMemoryChatStore};
use tokio::sync::mpsc;

/// A store that survived a restart while memory did not.
async fn store_with_history(turns: usize) -> Arc<InMemoryChatStore> {
    let store = Arc::new(InMemoryChatStore::new());
    store
        .create_session(&Session::with_id("s1", "alice"))
        .await
        .unwrap();
    for i in 0..turns {
        let message = if i % 2 == 0 {
            Message::user(format!("note {}", i))
        } else {
            Message::assistant(format!("note {}", i))
        };
        store.append_message("s1", &message).await.unwrap();
    }
    store
}

#[tokio::test]
async fn test_turn_after_restart_keeps_recent_context() {
    let store = store_with_history(14).await;
    let memory = Arc::new(TieredMemoryManager::in_memory(
        &MemoryConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));
    let relay = Relay::new(Arc::new(InMemoryBroker::default()));
    let queue = Arc::new(InMemoryTaskQueue::new());
    let rooms = RoomManager::new(
        store.clone(),
        relay.clone(),
        TurnDispatcher::new(queue.clone(), QueueConfig::default()),
        memory.clone(),
    );

    let (tx, _rx) = mpsc::unbounded_channel();
    let addr = "127.0.0.1:9000".parse().unwrap();
    rooms
        .connect(ConnectionHandle::new("c1", "alice", addr, tx))
        .await
        .unwrap();
    rooms.join_room("c1", "s1").await.unwrap();
    let ack = rooms
        .send_message("c1", "s1", "what did we say?")
        .await
        .unwrap();
    assert!(matches!(ack, ServerEvent::MessageSent { .. }));

    let lease = queue.lease().await.unwrap().unwrap();
    let turn = match lease.job {
        Job::GenerateResponse(turn) => turn,
        other => panic!("unexpected {:?}", other),
    };

    let generator = Arc::new(ScriptedGenerator::with_text_chunks(&["ok"]));
    let worker = GenerationWorker::new(store.clone(), memory, relay, generator.clone());
    worker.process_turn(&turn).await.unwrap();

    let request = &generator.requests()[0];
    assert_eq!(request.messages.len(), 10);
    assert_eq!(request.messages[0].content, "note 5");
    assert!(request.messages.iter().any(|m| m.role == Role::Assistant));
    let last = request.messages.last().unwrap();
    assert_eq!(last.content, "what did we say?");
    assert_eq!(last.id, turn.message_id);
}
