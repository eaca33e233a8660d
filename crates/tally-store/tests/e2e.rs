//! End-to-end tests for tally-store.
//!
//! Runs a real server on a random port and talks to it over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tally_core::protocol::{ClientMessage, ServerMessage};
use tally_core::{ManualClock, UserId};
use tally_store::{SnapshotStorage, StoreServer};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Test client speaking the store protocol.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws, next_id: 1 }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send(&mut self, msg: &ClientMessage) {
        self.send_text(&msg.to_json()).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send message");
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let next = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timeout waiting for message");
            match next {
                Some(Ok(Message::Text(text))) => {
                    return ServerMessage::from_json(text.as_str()).expect("Invalid server message");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    /// Assert nothing arrives within `duration`.
    async fn expect_silence(&mut self, duration: Duration) {
        if let Ok(Some(Ok(msg))) = timeout(duration, self.ws.next()).await {
            panic!("Unexpected message: {:?}", msg);
        }
    }

    async fn load(&mut self, user: &UserId) -> Option<Value> {
        let id = self.next_id();
        self.send(&ClientMessage::Load {
            id,
            user_id: user.clone(),
        })
        .await;
        match self.recv().await {
            ServerMessage::Loaded { id: got, record } if got == id => record,
            other => panic!("Expected loaded, got {:?}", other),
        }
    }

    async fn save(&mut self, user: &UserId, state: Value, timestamp: i64) -> ServerMessage {
        let id = self.next_id();
        self.send(&ClientMessage::Save {
            id,
            user_id: user.clone(),
            state,
            timestamp,
        })
        .await;
        self.recv().await
    }

    async fn subscribe(&mut self, user: &UserId) -> Option<Value> {
        self.send(&ClientMessage::Subscribe {
            user_id: user.clone(),
        })
        .await;
        match self.recv().await {
            ServerMessage::Changed { record, .. } => record,
            other => panic!("Expected changed, got {:?}", other),
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn alice() -> UserId {
    UserId::new("alice").unwrap()
}

async fn start_server(storage: Option<SnapshotStorage>) -> SocketAddr {
    start_server_with_clock(storage, ManualClock::new(5_000)).await
}

async fn start_server_with_clock(
    storage: Option<SnapshotStorage>,
    clock: Arc<ManualClock>,
) -> SocketAddr {
    let server = StoreServer::new(storage, clock).expect("Failed to create server");
    let listener = StoreServer::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(server.run(listener));
    addr
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_load_missing_document() {
    let addr = start_server(None).await;
    let mut client = TestClient::connect(addr).await;

    assert_eq!(client.load(&alice()).await, None);
    client.close().await;
}

#[tokio::test]
async fn test_save_then_load() {
    let addr = start_server(None).await;
    let mut client = TestClient::connect(addr).await;

    let response = client.save(&alice(), json!({ "notes": "hi" }), 100).await;
    assert_eq!(response, ServerMessage::Saved { id: 1, timestamp: 100 });

    let record = client.load(&alice()).await.unwrap();
    assert_eq!(record, json!({ "notes": "hi", "updatedAt": 100 }));
}

#[tokio::test]
async fn test_older_or_equal_write_rejected() {
    let addr = start_server(None).await;
    let mut client = TestClient::connect(addr).await;

    client.save(&alice(), json!({ "notes": "new" }), 100).await;

    for ts in [90, 100] {
        let response = client.save(&alice(), json!({ "notes": "old" }), ts).await;
        assert!(matches!(
            response,
            ServerMessage::Rejected {
                remote_updated_at: Some(100),
                ..
            }
        ));
    }
    let record = client.load(&alice()).await.unwrap();
    assert_eq!(record["notes"], "new");
}

#[tokio::test]
async fn test_force_save_uses_server_clock() {
    let clock = ManualClock::new(5_000);
    let addr = start_server_with_clock(None, clock.clone()).await;
    let mut client = TestClient::connect(addr).await;

    client.save(&alice(), json!({ "notes": "first" }), 100).await;
    clock.advance(10);
    client
        .send(&ClientMessage::ForceSave {
            id: 9,
            user_id: alice(),
            state: json!({ "notes": "forced" }),
        })
        .await;

    assert_eq!(client.recv().await, ServerMessage::Saved { id: 9, timestamp: 5_010 });
    let record = client.load(&alice()).await.unwrap();
    assert_eq!(record["updatedAt"], 5_010);
}

#[tokio::test]
async fn test_invalid_messages_get_errors() {
    let addr = start_server(None).await;
    let mut client = TestClient::connect(addr).await;

    client.send_text("not json").await;
    assert!(matches!(client.recv().await, ServerMessage::Error { id: None, .. }));

    let response = client.save(&alice(), json!([1, 2, 3]), 100).await;
    assert!(matches!(response, ServerMessage::Error { id: Some(1), .. }));

    // Connection still usable
    assert_eq!(client.load(&alice()).await, None);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscribe_reports_current_document() {
    let addr = start_server(None).await;
    let mut writer = TestClient::connect(addr).await;
    writer.save(&alice(), json!({ "notes": "there" }), 100).await;

    let mut reader = TestClient::connect(addr).await;
    let record = reader.subscribe(&alice()).await.unwrap();
    assert_eq!(record["notes"], "there");
    assert_eq!(record["updatedAt"], 100);
}

#[tokio::test]
async fn test_changes_pushed_to_all_subscribers() {
    let addr = start_server(None).await;
    let mut writer = TestClient::connect(addr).await;
    let mut other = TestClient::connect(addr).await;
    assert_eq!(writer.subscribe(&alice()).await, None);
    assert_eq!(other.subscribe(&alice()).await, None);

    // The writer hears its own change before the response
    match writer.save(&alice(), json!({ "notes": "v1" }), 100).await {
        ServerMessage::Changed { record, .. } => assert_eq!(record.unwrap()["updatedAt"], 100),
        other => panic!("Expected changed, got {:?}", other),
    }
    assert_eq!(writer.recv().await, ServerMessage::Saved { id: 1, timestamp: 100 });

    let push = other.recv().await;
    assert_eq!(
        push,
        ServerMessage::Changed {
            user_id: alice(),
            record: Some(json!({ "notes": "v1", "updatedAt": 100 })),
        }
    );
}

#[tokio::test]
async fn test_rejected_write_pushes_nothing() {
    let addr = start_server(None).await;
    let mut writer = TestClient::connect(addr).await;
    let mut other = TestClient::connect(addr).await;
    writer.save(&alice(), json!({ "notes": "v1" }), 100).await;
    other.subscribe(&alice()).await;

    writer.save(&alice(), json!({ "notes": "stale" }), 50).await;
    other.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_unsubscribe_and_disconnect_stop_pushes() {
    let addr = start_server(None).await;
    let mut writer = TestClient::connect(addr).await;
    let mut leaving = TestClient::connect(addr).await;
    let closing = {
        let mut client = TestClient::connect(addr).await;
        client.subscribe(&alice()).await;
        client
    };
    leaving.subscribe(&alice()).await;
    leaving
        .send(&ClientMessage::Unsubscribe { user_id: alice() })
        .await;
    closing.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = writer.save(&alice(), json!({ "notes": "v1" }), 100).await;
    assert!(matches!(response, ServerMessage::Saved { .. }));
    leaving.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_other_users_not_notified() {
    let addr = start_server(None).await;
    let mut writer = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    bob.subscribe(&UserId::new("bob").unwrap()).await;

    writer.save(&alice(), json!({ "notes": "v1" }), 100).await;
    bob.expect_silence(Duration::from_millis(200)).await;
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_documents_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("documents.json");

    let addr = start_server(Some(SnapshotStorage::new(&path))).await;
    let mut client = TestClient::connect(addr).await;
    client.save(&alice(), json!({ "notes": "kept" }), 100).await;
    client.close().await;

    let addr = start_server(Some(SnapshotStorage::new(&path))).await;
    let mut client = TestClient::connect(addr).await;
    let record = client.load(&alice()).await.unwrap();
    assert_eq!(record, json!({ "notes": "kept", "updatedAt": 100 }));
}

// ============================================================================
// Connections
// ============================================================================

#[tokio::test]
async fn test_idle_socket_does_not_block_requests() {
    let addr = start_server(None).await;

    // Connects but never sends the upgrade request
    let _idle = TcpStream::connect(addr).await.expect("Failed to connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TestClient::connect(addr).await;
    let result = timeout(Duration::from_secs(2), client.load(&alice())).await;
    assert_eq!(result.expect("Load should not wait on the idle socket"), None);

    let saved = client.save(&alice(), json!({"notes": "hi"}), 10).await;
    assert!(matches!(saved, ServerMessage::Saved { timestamp: 10, .. }));
}

#[tokio::test]
async fn test_idle_socket_dropped_after_handshake_timeout() {
    use tokio::io::AsyncReadExt;

    let server = StoreServer::new(None, ManualClock::new(0))
        .expect("Failed to create server")
        .with_handshake_timeout(Duration::from_millis(100));
    let listener = StoreServer::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(server.run(listener));

    let mut idle = TcpStream::connect(addr).await.expect("Failed to connect");
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), idle.read(&mut buf))
        .await
        .expect("Server should close the idle socket");
    assert!(matches!(read, Ok(0) | Err(_)));
}
