use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::adapters::{WsConfig, WsTransport};
use crate::client::{ChatClient, ClientConfig};
use crate::core::{ChatConfig, ChatEvent, MessageId, ServerFrame};
use crate::storage::{MemoryStore, MessageStore, SqliteStore};
use crate::transport::{FanoutBus, MemoryBus};

const CODE: &str = "secret";

async fn spawn_server<S: MessageStore + 'static>(
    store: Arc<S>,
    recovery_window: Duration,
) -> Result<(ClientConfig, JoinHandle<()>), Box<dyn std::error::Error>> {
    let ws = WsConfig { channel_capacity: 32, recovery_window };
    spawn_server_on(store, Arc::new(MemoryBus::new(64)), ws).await
}

async fn spawn_server_on<S: MessageStore + 'static>(
    store: Arc<S>,
    bus: Arc<MemoryBus>,
    ws: WsConfig,
) -> Result<(ClientConfig, JoinHandle<()>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let transport = WsTransport::new(store, bus, ChatConfig { delete_code: CODE.to_string() }, ws);
    let server_handle = tokio::spawn(async move {
        transport
            .serve_with_shutdown(listener, std::future::pending())
            .await
            .unwrap();
    });
    let config = ClientConfig {
        url: format!("ws://{addr}/ws"),
        reconnect_interval: Duration::from_millis(100),
        max_retries: 5,
    };
    Ok((config, server_handle))
}

async fn next_frame(client: &mut ChatClient) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("bad frame")
}

async fn expect_silence(client: &mut ChatClient) {
    let received = tokio::time::timeout(Duration::from_millis(300), client.next_event()).await;
    assert!(received.is_err(), "expected no frame, got {received:?}");
}

type RawSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Next frame on a bare socket, `None` once it closes or goes quiet.
async fn read_frame(socket: &mut RawSocket) -> Option<ServerFrame> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), socket.next()).await.ok()? {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).ok(),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Reads the greeting every connection starts with.
async fn session_of(client: &mut ChatClient) -> (uuid::Uuid, bool) {
    match next_frame(client).await {
        ServerFrame::Session { session_id, recovered } => (session_id, recovered),
        other => panic!("expected session frame, got {other:?}"),
    }
}

fn posted(content: &str, id: MessageId, username: &str) -> ServerFrame {
    ServerFrame::MessagePosted {
        content: content.to_string(),
        id,
        username: username.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_is_acked_and_broadcast_once() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let (config, server_handle) = spawn_server(store.clone(), Duration::from_secs(60)).await?;

    let mut alice = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut alice).await;
    let mut bob = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut bob).await;

    let ack_id = alice.post_with_offset("hi", "tok-1", "alice").await?;
    let mut frames = vec![next_frame(&mut alice).await, next_frame(&mut alice).await];
    frames.sort_by_key(|f| matches!(f, ServerFrame::Ack { .. }));
    assert_eq!(frames, vec![posted("hi", 1, "alice"), ServerFrame::Ack { ack_id }]);
    assert_eq!(next_frame(&mut bob).await, posted("hi", 1, "alice"));

    // Lost ack: the same client offset goes out again.
    let retry_ack = alice.post_with_offset("hi", "tok-1", "alice").await?;
    assert_eq!(next_frame(&mut alice).await, ServerFrame::Ack { ack_id: retry_ack });
    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;
    assert_eq!(store.len().await, 1);

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_with_offset_backfills_only_that_client() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("chat.db"), 4).await?);
    for n in 1..=3 {
        store.append(&format!("m{n}"), &format!("tok-{n}"), "alice").await?;
    }
    let (config, server_handle) = spawn_server(store, Duration::from_secs(60)).await?;

    let mut watcher = ChatClient::connect_from(config.clone(), Some(3), None).await?;
    session_of(&mut watcher).await;

    let mut client = ChatClient::connect_from(config.clone(), Some(1), None).await?;
    let (_, recovered) = session_of(&mut client).await;
    assert!(!recovered);
    assert_eq!(next_frame(&mut client).await, posted("m2", 2, "alice"));
    assert_eq!(next_frame(&mut client).await, posted("m3", 3, "alice"));
    expect_silence(&mut client).await;
    expect_silence(&mut watcher).await;
    assert_eq!(client.server_offset(), Some(3));

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_connection_without_offset_gets_full_log() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    store.append("first", "tok-1", "alice").await?;
    store.append("second", "tok-2", "bob").await?;
    store.delete_by_id(1).await?;
    let (config, server_handle) = spawn_server(store, Duration::from_secs(60)).await?;

    let mut client = ChatClient::connect_with_retry(config).await?;
    session_of(&mut client).await;
    assert_eq!(next_frame(&mut client).await, posted("second", 2, "bob"));
    expect_silence(&mut client).await;

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_needs_the_right_code() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let id = store.append("oops", "tok-1", "alice").await?;
    let (config, server_handle) = spawn_server(store.clone(), Duration::from_secs(60)).await?;

    let mut alice = ChatClient::connect_from(config.clone(), Some(id), None).await?;
    session_of(&mut alice).await;
    let mut bob = ChatClient::connect_from(config.clone(), Some(id), None).await?;
    session_of(&mut bob).await;

    alice.delete(id, "wrong").await?;
    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;
    assert!(store.find_by_id(id).await?.is_some());

    alice.delete(id, CODE).await?;
    assert_eq!(next_frame(&mut alice).await, ServerFrame::MessageDeleted { id });
    assert_eq!(next_frame(&mut bob).await, ServerFrame::MessageDeleted { id });
    assert!(store.find_by_id(id).await?.is_none());

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_session_gets_buffered_events_without_replay() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let (config, server_handle) = spawn_server(store, Duration::from_secs(60)).await?;

    let mut alice = ChatClient::connect_with_retry(config.clone()).await?;
    let (session_id, _) = session_of(&mut alice).await;
    let mut bob = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut bob).await;

    bob.post_with_offset("before", "tok-1", "bob").await?;
    assert_eq!(next_frame(&mut alice).await, posted("before", 1, "bob"));

    alice.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.post_with_offset("while away", "tok-2", "bob").await?;
    bob.delete(1, CODE).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Presenting an offset of 0 would replay everything if the session were not resumed.
    let mut alice = ChatClient::connect_from(config.clone(), Some(0), Some(session_id)).await?;
    assert_eq!(session_of(&mut alice).await, (session_id, true));
    assert_eq!(next_frame(&mut alice).await, posted("while away", 2, "bob"));
    assert_eq!(next_frame(&mut alice).await, ServerFrame::MessageDeleted { id: 1 });
    expect_silence(&mut alice).await;

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_session_falls_back_to_replay() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let (config, server_handle) = spawn_server(store, Duration::ZERO).await?;

    let mut alice = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut alice).await;
    alice.post_with_offset("mine", "tok-1", "alice").await?;
    let _ = next_frame(&mut alice).await;
    let _ = next_frame(&mut alice).await;

    alice.reconnect().await?;
    let old_session = alice.session_id();
    let (session_id, recovered) = session_of(&mut alice).await;
    assert!(!recovered);
    assert_ne!(Some(session_id), old_session);
    // Offset 1 was remembered, so nothing is resent.
    expect_silence(&mut alice).await;

    let mut late = ChatClient::connect_from(config, None, Some(session_id)).await?;
    let (_, recovered) = session_of(&mut late).await;
    assert!(!recovered);
    assert_eq!(next_frame(&mut late).await, posted("mine", 1, "alice"));

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_mid_stream_loses_nothing_on_resume() -> Result<(), Box<dyn std::error::Error>> {
    const TOTAL: MessageId = 2000;
    let bus = Arc::new(MemoryBus::new(4096));
    let ws = WsConfig { channel_capacity: 32, recovery_window: Duration::from_secs(60) };
    let (config, server_handle) = spawn_server_on(Arc::new(MemoryStore::new()), bus.clone(), ws).await?;

    let (mut socket, _) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let session_id = match read_frame(&mut socket).await {
        Some(ServerFrame::Session { session_id, .. }) => session_id,
        other => panic!("expected session frame, got {other:?}"),
    };

    let publisher = tokio::spawn(async move {
        for id in 1..=TOTAL {
            bus.publish(ChatEvent::MessagePosted {
                content: format!("m{id}"),
                id,
                username: "bot".to_string(),
            })
            .await
            .unwrap();
            if id % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    let mut seen = Vec::new();
    while seen.len() < 50 {
        match read_frame(&mut socket).await {
            Some(ServerFrame::MessagePosted { id, .. }) => seen.push(id),
            Some(_) => continue,
            None => panic!("socket closed before the stream started"),
        }
    }
    socket.close(None).await?;
    // Whatever the server wrote before it saw the close still arrives on the old socket.
    while let Some(frame) = read_frame(&mut socket).await {
        if let ServerFrame::MessagePosted { id, .. } = frame {
            seen.push(id);
        }
    }
    publisher.await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut resumed = ChatClient::connect_from(config, None, Some(session_id)).await?;
    assert_eq!(session_of(&mut resumed).await, (session_id, true));
    while let Ok(Some(Ok(frame))) = tokio::time::timeout(Duration::from_millis(500), resumed.next_event()).await {
        if let ServerFrame::MessagePosted { id, .. } = frame {
            seen.push(id);
        }
    }

    // A frame cut off mid-write may show up on both sockets; nothing may be missing or reordered.
    seen.dedup();
    assert_eq!(seen, (1..=TOTAL).collect::<Vec<_>>());

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parked_session_that_lagged_catches_up_from_store() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let ws = WsConfig { channel_capacity: 32, recovery_window: Duration::from_secs(60) };
    let (config, server_handle) = spawn_server_on(store.clone(), Arc::new(MemoryBus::new(2)), ws).await?;

    let mut alice = ChatClient::connect_with_retry(config.clone()).await?;
    let (session_id, _) = session_of(&mut alice).await;
    alice.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut bob = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut bob).await;
    for n in 1..=10 {
        bob.post_with_offset(&format!("m{n}"), &format!("tok-{n}"), "bob").await?;
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.len().await < 10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    // Ten events went past a two-slot bus while alice was parked.
    let mut alice = ChatClient::connect_from(config, None, Some(session_id)).await?;
    assert_eq!(session_of(&mut alice).await, (session_id, true));
    for n in 1..=10 {
        assert_eq!(next_frame(&mut alice).await, posted(&format!("m{n}"), n, "bob"));
    }
    expect_silence(&mut alice).await;

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_completes_after_sender_disconnects() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let (config, server_handle) = spawn_server(store.clone(), Duration::from_secs(60)).await?;

    let mut bob = ChatClient::connect_with_retry(config.clone()).await?;
    session_of(&mut bob).await;
    let mut alice = ChatClient::connect_with_retry(config).await?;
    session_of(&mut alice).await;

    alice.post_with_offset("bye", "tok-1", "alice").await?;
    alice.disconnect().await?;

    assert_eq!(next_frame(&mut bob).await, posted("bye", 1, "alice"));
    assert!(store.find_by_id(1).await?.is_some());
    assert_eq!(store.len().await, 1);

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn index_page_is_served() -> Result<(), Box<dyn std::error::Error>> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (config, server_handle) = spawn_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await?;
    let addr = config.url.trim_start_matches("ws://").trim_end_matches("/ws").to_string();

    let mut stream = tokio::net::TcpStream::connect(&addr).await?;
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("text/html"));
    assert!(response.contains("<title>chat</title>"));

    server_handle.abort();
    Ok(())
}
