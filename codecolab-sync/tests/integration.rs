//! Integration tests for the relay.
//!
//! These tests start a real server and connect real clients (and raw
//! WebSocket peers where a test needs to forge frames), verifying the
//! full relay pipeline.

use std::sync::Arc;

use codecolab_core::{
    AccessLevel, CollabError, Document, DocumentSnapshot, DocumentStorage, EditOperation,
    MemoryStorage,
};
use codecolab_sync::{
    ClientConfig, ClientEvent, ClientState, CollabClient, ServerConfig, SyncServer, WireMessage,
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        storage_path: None,
    }
}

/// Start a server on a free port, return it and its URL.
async fn start_server(storage: Option<Arc<dyn DocumentStorage>>) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::with_storage(test_config(), storage));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, format!("ws://{addr}"))
}

async fn next_event(events: &mut Receiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Events that arrive within the quiet window.
async fn drain(events: &mut Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(QUIET, events.recv()).await {
        seen.push(event);
    }
    seen
}

async fn connected_client(
    url: &str,
    user_id: &str,
    name: &str,
) -> (CollabClient, Receiver<ClientEvent>) {
    let mut client = CollabClient::new(user_id, name);
    let mut events = client.take_event_rx().unwrap();
    client.connect(url).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    (client, events)
}

async fn joined_client(
    url: &str,
    user_id: &str,
    name: &str,
    doc: &str,
) -> (CollabClient, Receiver<ClientEvent>) {
    let (client, mut events) = connected_client(url, user_id, name).await;
    client.join_document(doc).unwrap();
    match next_event(&mut events).await {
        ClientEvent::DocumentJoined { document_id, .. } => assert_eq!(document_id, doc),
        other => panic!("expected DocumentJoined, got {other:?}"),
    }
    (client, events)
}

async fn raw_connect(url: &str) -> RawSocket {
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

async fn raw_send(ws: &mut RawSocket, msg: &WireMessage) {
    ws.send(Message::text(msg.encode().unwrap())).await.unwrap();
}

async fn raw_recv(ws: &mut RawSocket, wait: Duration) -> Option<WireMessage> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(WireMessage::decode(text.as_str()).unwrap());
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn raw_join(ws: &mut RawSocket, doc: &str, user_id: &str) -> WireMessage {
    raw_send(ws, &WireMessage::join(doc, user_id, user_id)).await;
    raw_recv(ws, WAIT).await.expect("join response")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, url) = start_server(None).await;
    let _ws = raw_connect(&url).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_edit_relayed_once_with_server_identity() {
    let (_server, url) = start_server(None).await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc1").await;

    let mut alice = raw_connect(&url).await;
    assert!(matches!(
        raw_join(&mut alice, "doc1", "u1").await,
        WireMessage::JoinResponse { success: true, .. }
    ));
    assert_eq!(
        next_event(&mut bob_events).await,
        ClientEvent::UserConnected { user_id: "u1".into(), username: "u1".into() }
    );

    let forged = EditOperation::new("mallory", "other-doc", 0, "hi", 0);
    raw_send(&mut alice, &WireMessage::Edit(forged)).await;

    match next_event(&mut bob_events).await {
        ClientEvent::EditReceived(op) => {
            assert_eq!(op.user_id, "u1");
            assert_eq!(op.document_id, "doc1");
            assert_eq!(op.insertion, "hi");
        }
        other => panic!("expected EditReceived, got {other:?}"),
    }
    assert!(drain(&mut bob_events).await.is_empty());
    assert_eq!(raw_recv(&mut alice, QUIET).await, None, "sender must not get an echo");
}

#[tokio::test]
async fn test_cursor_and_chat_exclude_sender() {
    let (_server, url) = start_server(None).await;
    let (alice, mut alice_events) = joined_client(&url, "u1", "Alice", "doc1").await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc1").await;
    assert!(matches!(next_event(&mut alice_events).await, ClientEvent::UserConnected { .. }));

    alice.send_cursor_position(4).unwrap();
    alice.send_chat_message("hello bob").unwrap();

    assert_eq!(
        next_event(&mut bob_events).await,
        ClientEvent::CursorPositionReceived {
            user_id: "u1".into(),
            username: "Alice".into(),
            position: 4
        }
    );
    assert_eq!(
        next_event(&mut bob_events).await,
        ClientEvent::ChatMessageReceived {
            user_id: "u1".into(),
            username: "Alice".into(),
            message: "hello bob".into()
        }
    );
    assert!(drain(&mut alice_events).await.is_empty());
}

#[tokio::test]
async fn test_disconnect_without_leave_notifies_once() {
    let (server, url) = start_server(None).await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc1").await;

    let mut alice = raw_connect(&url).await;
    raw_join(&mut alice, "doc1", "u1").await;
    assert!(matches!(next_event(&mut bob_events).await, ClientEvent::UserConnected { .. }));

    drop(alice);

    assert_eq!(next_event(&mut bob_events).await, ClientEvent::UserDisconnected("u1".into()));
    assert!(drain(&mut bob_events).await.is_empty());
    assert_eq!(server.directory().read().await.session_count(), 1);
}

#[tokio::test]
async fn test_leave_then_disconnect_notifies_once() {
    let (_server, url) = start_server(None).await;
    let (mut alice, mut alice_events) = joined_client(&url, "u1", "Alice", "doc1").await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc1").await;

    alice.leave_document().unwrap();
    assert!(matches!(alice.state(), ClientState::Leaving(_)));
    loop {
        match next_event(&mut alice_events).await {
            ClientEvent::DocumentLeft(doc) => {
                assert_eq!(doc, "doc1");
                break;
            }
            ClientEvent::UserConnected { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(alice.state(), ClientState::Connected);
    assert!(alice.roster().is_empty());

    alice.disconnect();
    assert_eq!(alice.state(), ClientState::Disconnected);

    assert_eq!(next_event(&mut bob_events).await, ClientEvent::UserDisconnected("u1".into()));
    assert!(drain(&mut bob_events).await.is_empty());
}

#[tokio::test]
async fn test_second_join_fails_with_already_joined() {
    let (_server, url) = start_server(None).await;
    let mut ws = raw_connect(&url).await;
    raw_join(&mut ws, "doc1", "u1").await;

    match raw_join(&mut ws, "doc2", "u1").await {
        WireMessage::JoinResponse { success, code, .. } => {
            assert!(!success);
            assert_eq!(code.as_deref(), Some("already_joined"));
        }
        other => panic!("expected join_response, got {other:?}"),
    }

    // The client refuses locally without touching the socket.
    let (client, _events) = joined_client(&url, "u3", "Carol", "doc1").await;
    assert_eq!(client.join_document("doc2"), Err(CollabError::AlreadyJoined("doc1".into())));
}

#[tokio::test]
async fn test_client_sends_require_join() {
    let (_server, url) = start_server(None).await;
    let (client, mut events) = connected_client(&url, "u1", "Alice").await;

    assert_eq!(client.send_edit(0, "x", 0), Err(CollabError::NotJoined));
    assert_eq!(client.send_chat_message("hi"), Err(CollabError::NotJoined));
    assert!(drain(&mut events).await.is_empty());
}

#[tokio::test]
async fn test_frames_before_join_get_protocol_error() {
    let (_server, url) = start_server(None).await;
    let mut ws = raw_connect(&url).await;

    raw_send(&mut ws, &WireMessage::Edit(EditOperation::insert("u1", "doc1", 0, "x"))).await;
    match raw_recv(&mut ws, WAIT).await {
        Some(WireMessage::Error { code, .. }) => assert_eq!(code, "protocol_error"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let (server, url) = start_server(None).await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::text("{not json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"edit","payload":{"position":-1}}"#)).await.unwrap();
    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(raw_recv(&mut ws, QUIET).await, None);

    // The connection survives.
    assert!(matches!(
        raw_join(&mut ws, "doc1", "u1").await,
        WireMessage::JoinResponse { success: true, .. }
    ));
    assert_eq!(server.stats().await.malformed_frames, 3);
}

#[tokio::test]
async fn test_connect_timeout() {
    // Accepts TCP but never answers the WebSocket handshake.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let config = ClientConfig {
        connect_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let mut client = CollabClient::with_config("u1", "Alice", config);
    let err = client.connect(&format!("ws://{addr}")).await.unwrap_err();
    assert_eq!(err, CollabError::ConnectionTimeout(Duration::from_millis(200)));
    assert_eq!(client.state(), ClientState::Disconnected);
    drop(silent);
}

#[tokio::test]
async fn test_connect_error() {
    let mut client = CollabClient::new("u1", "Alice");
    let err = client.connect("ws://127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, CollabError::ConnectionError(_)));
}

#[tokio::test]
async fn test_request_content_and_join_seed() {
    let (_server, url) = start_server(None).await;
    let (alice, mut alice_events) = joined_client(&url, "u1", "Alice", "doc1").await;

    alice.send_edit(0, "helo", 0).unwrap();
    alice.send_edit(3, "l", 0).unwrap();
    alice.request_content().unwrap();
    assert_eq!(next_event(&mut alice_events).await, ClientEvent::ContentReceived("hello".into()));

    let (bob, mut bob_events) = connected_client(&url, "u2", "Bob").await;
    bob.join_document("doc1").unwrap();
    match next_event(&mut bob_events).await {
        ClientEvent::DocumentJoined { content, users, .. } => {
            assert_eq!(content, "hello");
            let ids: Vec<_> = users.iter().map(|u| u.user_id.as_str()).collect();
            assert_eq!(ids, vec!["u1", "u2"]);
        }
        other => panic!("expected DocumentJoined, got {other:?}"),
    }
    assert_eq!(bob.roster().len(), 2);
}

#[tokio::test]
async fn test_out_of_range_edit_rejected() {
    let (_server, url) = start_server(None).await;
    let (alice, mut alice_events) = joined_client(&url, "u1", "Alice", "doc1").await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc1").await;

    alice.send_edit(10, "x", 0).unwrap();
    loop {
        match next_event(&mut alice_events).await {
            ClientEvent::Error { code, .. } => {
                assert_eq!(code, "out_of_range");
                break;
            }
            ClientEvent::UserConnected { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(drain(&mut bob_events).await.is_empty());
}

#[tokio::test]
async fn test_stored_document_access_is_enforced() {
    let storage = Arc::new(MemoryStorage::new());
    let mut doc = Document::new("plan", "Plan", "alice");
    doc.edit_content("draft", "alice").unwrap();
    doc.share_with("bob", AccessLevel::ReadOnly).unwrap();
    storage.save(&DocumentSnapshot::capture(&doc, "Alice")).unwrap();

    let shared: Arc<dyn DocumentStorage> = storage.clone();
    let (_server, url) = start_server(Some(shared)).await;

    let (mallory, mut mallory_events) = connected_client(&url, "mallory", "Mallory").await;
    mallory.join_document("plan").unwrap();
    match next_event(&mut mallory_events).await {
        ClientEvent::Error { code, .. } => assert_eq!(code, "permission_denied"),
        other => panic!("expected permission error, got {other:?}"),
    }
    assert_eq!(mallory.state(), ClientState::Connected);

    let (alice, mut alice_events) = joined_client(&url, "alice", "Alice", "plan").await;
    let (bob, mut bob_events) = joined_client(&url, "bob", "Bob", "plan").await;
    assert!(matches!(next_event(&mut alice_events).await, ClientEvent::UserConnected { .. }));

    bob.send_edit(0, "x", 0).unwrap();
    match next_event(&mut bob_events).await {
        ClientEvent::Error { code, .. } => assert_eq!(code, "permission_denied"),
        other => panic!("expected permission error, got {other:?}"),
    }
    assert!(drain(&mut alice_events).await.is_empty());

    alice.send_edit(5, "!", 0).unwrap();
    match next_event(&mut bob_events).await {
        ClientEvent::EditReceived(op) => assert_eq!(op.insertion, "!"),
        other => panic!("expected edit, got {other:?}"),
    }

    // Closing the room writes the content back, off the relay's lock.
    drop(alice);
    drop(bob);
    let saved = timeout(WAIT, async {
        loop {
            if storage.load("plan").map(|s| s.content).ok().as_deref() == Some("draft!") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(saved.is_ok(), "closed room was not written back");
}

#[tokio::test]
async fn test_reopened_stored_room_keeps_latest_content() {
    let storage = Arc::new(MemoryStorage::new());
    let doc = Document::new("plan", "Plan", "alice");
    storage.save(&DocumentSnapshot::capture(&doc, "Alice")).unwrap();
    let shared: Arc<dyn DocumentStorage> = storage.clone();
    let (server, url) = start_server(Some(shared)).await;

    let (alice, mut events) = joined_client(&url, "alice", "Alice", "plan").await;
    for round in 0..20 {
        alice.send_edit(round, "x", 0).unwrap();
        alice.leave_document().unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::DocumentLeft("plan".into()));
        alice.join_document("plan").unwrap();
        match next_event(&mut events).await {
            ClientEvent::DocumentJoined { content, .. } => {
                assert_eq!(content, "x".repeat(round + 1));
            }
            other => panic!("expected DocumentJoined, got {other:?}"),
        }
    }
    assert_eq!(server.stats().await.active_rooms, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_server(None).await;
    let (alice, _alice_events) = joined_client(&url, "u1", "Alice", "doc1").await;
    let (_bob, mut bob_events) = joined_client(&url, "u2", "Bob", "doc2").await;

    alice.send_chat_message("doc1 only").unwrap();
    assert!(drain(&mut bob_events).await.is_empty());
}

#[tokio::test]
async fn test_server_drop_disconnects_client() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Minimal peer: complete the handshake, then hang up.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);
    });

    let (client, mut events) = connected_client(&format!("ws://{addr}"), "u1", "Alice").await;
    let mut event = next_event(&mut events).await;
    if let ClientEvent::Error { code, .. } = &event {
        // A hang-up without a close frame is reported before the disconnect.
        assert_eq!(code, "connection_error");
        event = next_event(&mut events).await;
    }
    assert_eq!(event, ClientEvent::Disconnected);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.join_document("doc1"), Err(CollabError::connection("not connected")));
}

#[tokio::test]
async fn test_corrupt_frame_surfaces_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Peer that answers the handshake, then sends a frame with a reserved
    // opcode and stays open.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.get_mut().write_all(&[0x83, 0x00]).await.unwrap();
        ws.get_mut().flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(ws);
    });

    let (client, mut events) = connected_client(&format!("ws://{addr}"), "u1", "Alice").await;
    match next_event(&mut events).await {
        ClientEvent::Error { code, message } => {
            assert_eq!(code, "connection_error");
            assert!(!message.is_empty());
        }
        other => panic!("expected connection error, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_ack_is_never_undone() {
    let (_server, url) = start_server(None).await;
    let (client, mut events) = joined_client(&url, "u1", "Alice", "doc1").await;

    for _ in 0..150 {
        client.leave_document().unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::DocumentLeft("doc1".into()));
        assert_eq!(client.state(), ClientState::Connected);

        client.join_document("doc1").unwrap();
        assert!(matches!(next_event(&mut events).await, ClientEvent::DocumentJoined { .. }));
        assert_eq!(client.state(), ClientState::Joined("doc1".into()));
    }
}
