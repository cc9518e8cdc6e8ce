use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_config::{GatewayConfig, MemoryConfig, QueueConfig, WorkerConfig};
use parley_core::{ErrorCode, ServerEvent, Session};
use parley_gateway::{Gateway, RoomManager};
use parley_llm::{HashEmbedder, ScriptedGenerator};
use parley_memory::TieredMemoryManager;
use parley_queue::InMemoryTaskQueue;
use parley_relay::{InMemoryBroker, Relay};
use parley_runner::{GenerationWorker, PoolHandle, TurnDispatcher, WorkerPool};
use parley_session::{ChatStore, InMemoryChatStore};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    url: String,
    store: Arc<InMemoryChatStore>,
    shutdown: CancellationToken,
    pool: PoolHandle,
}

async fn start(config: GatewayConfig) -> Server {
    let store = Arc::new(InMemoryChatStore::new());
    store
        .create_session(&Session::with_id("s1", "alice"))
        .await
        .unwrap();

    let relay = Relay::new(Arc::new(InMemoryBroker::default()));
    let queue = Arc::new(InMemoryTaskQueue::new());
    let dispatcher = TurnDispatcher::new(queue.clone(), QueueConfig::default());
    let memory = Arc::new(TieredMemoryManager::in_memory(
        &MemoryConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));

    let worker = GenerationWorker::new(
        store.clone(),
        memory.clone(),
        relay.clone(),
        Arc::new(ScriptedGenerator::with_text_chunks(&["Hi", " there!"])),
    );
    let pool = WorkerPool::new(queue, Arc::new(worker), &WorkerConfig::default()).start();

    let rooms = Arc::new(RoomManager::new(store.clone(), relay, dispatcher, memory));
    let gateway = Gateway::new(config, rooms);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { gateway.serve(listener, token).await });

    Server {
        url,
        store,
        shutdown,
        pool,
    }
}

async fn client(server: &Server) -> Client {
    let (ws, _) = connect_async(server.url.as_str()).await.unwrap();
    ws
}

async fn send(ws: &mut Client, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_event(ws: &mut Client) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip events until one of the given kind arrives.
async fn expect_kind(ws: &mut Client, kind: &str) -> ServerEvent {
    loop {
        let event = next_event(ws).await;
        if event.kind() == kind {
            return event;
        }
    }
}

async fn connect_as(server: &Server, user: &str) -> Client {
    let mut ws = client(server).await;
    send(&mut ws, json!({"type": "connect", "user_id": user})).await;
    expect_kind(&mut ws, "connected").await;
    ws
}

#[tokio::test]
async fn test_message_streams_back_to_the_room() {
    let server = start(GatewayConfig::default()).await;
    let mut ws = connect_as(&server, "alice").await;

    send(&mut ws, json!({"type": "join_room", "chat_id": "s1"})).await;
    expect_kind(&mut ws, "room_joined").await;

    send(&mut ws, json!({"type": "message", "chat_id": "s1", "content": "Hello"})).await;
    expect_kind(&mut ws, "message_sent").await;

    let mut chunks = Vec::new();
    loop {
        match next_event(&mut ws).await {
            ServerEvent::Chunk(content) => chunks.push(content),
            ServerEvent::End { usage, .. } => {
                assert!(usage.total_tokens > 0);
                break;
            }
            ServerEvent::Error { message, .. } => panic!("turn failed: {}", message),
            _ => {}
        }
    }
    assert_eq!(chunks, vec!["Hi", " there!"]);

    let history = server.store.history("s1", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Hi there!");

    server.shutdown.cancel();
    server.pool.shutdown().await;
}

#[tokio::test]
async fn test_frames_before_connect_are_rejected() {
    let server = start(GatewayConfig::default()).await;
    let mut ws = client(&server).await;

    send(&mut ws, json!({"type": "join_room", "chat_id": "s1"})).await;
    match next_event(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotConnected),
        other => panic!("unexpected {:?}", other),
    }

    send(&mut ws, json!({"type": "bogus"})).await;
    match next_event(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown.cancel();
}

#[tokio::test]
async fn test_joining_someone_elses_room_is_unauthorized() {
    let server = start(GatewayConfig::default()).await;
    let mut ws = connect_as(&server, "mallory").await;

    send(&mut ws, json!({"type": "join_room", "chat_id": "s1"})).await;
    match expect_kind(&mut ws, "error").await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_token_closes_connection() {
    let server = start(GatewayConfig {
        auth_token: Some("secret".to_string()),
        ..GatewayConfig::default()
    })
    .await;
    let mut ws = client(&server).await;

    send(&mut ws, json!({"type": "connect", "user_id": "alice", "token": "guess"})).await;
    match next_event(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown.cancel();
}

#[tokio::test]
async fn test_connections_over_capacity_are_turned_away() {
    let server = start(GatewayConfig {
        max_connections: 1,
        ..GatewayConfig::default()
    })
    .await;
    let _first = connect_as(&server, "alice").await;

    let mut second = client(&server).await;
    match next_event(&mut second).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::CapacityExceeded),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown.cancel();
}
