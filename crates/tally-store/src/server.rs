//! WebSocket document store.
//!
//! A single task owns the document table, so every conditional write is
//! atomic with respect to every other request. Connection read tasks feed
//! it `ConnectionEvent`s over one channel.

use crate::connection::{ClientConnection, ConnId, ConnectionEvent};
use crate::persistence::SnapshotStorage;
use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tally_core::protocol::{ClientMessage, RequestId, ServerMessage};
use tally_core::remote::StoredDocument;
use tally_core::{Clock, DocumentTable, SaveOutcome, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// How long a new TCP connection may take to complete the WebSocket upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// Wire form of a stored document: the state object plus `updatedAt`.
pub fn record_value(doc: &StoredDocument<Value>) -> Value {
    let mut record = doc.payload.clone();
    if let Value::Object(map) = &mut record {
        map.insert("updatedAt".into(), Value::from(doc.updated_at));
    }
    record
}

pub struct StoreServer {
    documents: DocumentTable<Value>,
    storage: Option<SnapshotStorage>,
    clock: Arc<dyn Clock>,
    connections: HashMap<ConnId, ClientConnection>,
    /// Connections subscribed to each user's document
    subscribers: HashMap<UserId, HashSet<ConnId>>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Handshakes finish off the request loop and land here
    upgraded_tx: mpsc::UnboundedSender<Upgraded>,
    upgraded_rx: mpsc::UnboundedReceiver<Upgraded>,
    handshake_timeout: Duration,
}

impl StoreServer {
    /// Create a server, loading documents from `storage` when given.
    pub fn new(storage: Option<SnapshotStorage>, clock: Arc<dyn Clock>) -> Result<Self> {
        let documents = match &storage {
            Some(storage) => {
                let documents = storage.load()?;
                info!(
                    "Loaded {} document(s) from {}",
                    documents.len(),
                    storage.path().display()
                );
                documents
            }
            None => DocumentTable::new(),
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, upgraded_rx) = mpsc::unbounded_channel();

        Ok(Self {
            documents,
            storage,
            clock,
            connections: HashMap::new(),
            subscribers: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
            upgraded_tx,
            upgraded_rx,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Store listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and serve requests until the listener fails.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_handshake(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some((ws_stream, addr)) = self.upgraded_rx.recv() => {
                    self.register(ws_stream, addr);
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// Upgrade a new socket off the request loop.
    fn spawn_handshake(&self, stream: TcpStream, addr: SocketAddr) {
        let upgraded_tx = self.upgraded_tx.clone();
        let limit = self.handshake_timeout;
        tokio::spawn(async move {
            let ws_stream = match tokio::time::timeout(limit, accept_async(stream)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    // Health checks connect and close without upgrading
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
                Err(_) => {
                    warn!("WebSocket upgrade from {} timed out after {:?}", addr, limit);
                    return;
                }
            };
            let _ = upgraded_tx.send((ws_stream, addr));
        });
    }

    fn register(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;
        info!("New connection from {} ({})", addr, conn_id);

        let conn = ClientConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn_id, message } => {
                self.handle_message(&conn_id, message).await;
            }
            ConnectionEvent::Invalid { conn_id, error } => {
                warn!("Invalid message from {}: {}", conn_id, error);
                self.reply(&conn_id, ServerMessage::error(None, error)).await;
            }
            ConnectionEvent::Closed { conn_id } => {
                info!("Connection closed: {}", conn_id);
                self.connections.remove(&conn_id);
                for subs in self.subscribers.values_mut() {
                    subs.remove(&conn_id);
                }
                self.subscribers.retain(|_, subs| !subs.is_empty());
            }
        }
    }

    async fn handle_message(&mut self, conn_id: &ConnId, message: ClientMessage) {
        match message {
            ClientMessage::Load { id, user_id } => {
                let record = self.documents.get(&user_id).map(record_value);
                debug!("Load for {} from {} (found: {})", user_id, conn_id, record.is_some());
                self.reply(conn_id, ServerMessage::Loaded { id, record }).await;
            }
            ClientMessage::Save {
                id,
                user_id,
                state,
                timestamp,
            } => {
                let response = self.save(id, &user_id, state, timestamp).await;
                self.reply(conn_id, response).await;
            }
            ClientMessage::ForceSave { id, user_id, state } => {
                let response = self.force_save(id, &user_id, state).await;
                self.reply(conn_id, response).await;
            }
            ClientMessage::Subscribe { user_id } => {
                debug!("{} subscribed to {}", conn_id, user_id);
                self.subscribers
                    .entry(user_id.clone())
                    .or_default()
                    .insert(conn_id.clone());
                let change = self.current(&user_id);
                self.reply(conn_id, change).await;
            }
            ClientMessage::Unsubscribe { user_id } => {
                debug!("{} unsubscribed from {}", conn_id, user_id);
                if let Some(subs) = self.subscribers.get_mut(&user_id) {
                    subs.remove(conn_id);
                    if subs.is_empty() {
                        self.subscribers.remove(&user_id);
                    }
                }
            }
        }
    }

    async fn save(
        &mut self,
        id: RequestId,
        user_id: &UserId,
        state: Value,
        timestamp: i64,
    ) -> ServerMessage {
        if !state.is_object() {
            return ServerMessage::error(Some(id), "State must be a JSON object");
        }

        match self.documents.write_if_newer(user_id, state, timestamp) {
            SaveOutcome::Saved(timestamp) => {
                info!("Saved document for {} at {}", user_id, timestamp);
                self.persist();
                self.notify(user_id).await;
                ServerMessage::Saved { id, timestamp }
            }
            SaveOutcome::Stale { remote_updated_at } => {
                debug!(
                    "Rejected write for {} at {} (stored {:?})",
                    user_id, timestamp, remote_updated_at
                );
                ServerMessage::Rejected {
                    id,
                    remote_updated_at,
                }
            }
        }
    }

    async fn force_save(&mut self, id: RequestId, user_id: &UserId, state: Value) -> ServerMessage {
        if !state.is_object() {
            return ServerMessage::error(Some(id), "State must be a JSON object");
        }

        let timestamp = self.clock.now_ms();
        self.documents.overwrite(user_id, state, timestamp);
        info!("Force-saved document for {} at {}", user_id, timestamp);
        self.persist();
        self.notify(user_id).await;
        ServerMessage::Saved { id, timestamp }
    }

    fn current(&self, user_id: &UserId) -> ServerMessage {
        ServerMessage::Changed {
            user_id: user_id.clone(),
            record: self.documents.get(user_id).map(record_value),
        }
    }

    /// Push the current document to every subscriber, the writer included.
    async fn notify(&self, user_id: &UserId) {
        let Some(subs) = self.subscribers.get(user_id) else {
            return;
        };
        let change = self.current(user_id);
        for conn_id in subs {
            if let Some(conn) = self.connections.get(conn_id) {
                if let Err(e) = conn.send(&change).await {
                    warn!("Failed to push change to {}: {}", conn_id, e);
                }
            }
        }
    }

    async fn reply(&self, conn_id: &ConnId, message: ServerMessage) {
        let Some(conn) = self.connections.get(conn_id) else {
            debug!("Dropping reply for closed connection {}", conn_id);
            return;
        };
        if let Err(e) = conn.send(&message).await {
            warn!("Failed to reply to {}: {}", conn_id, e);
        }
    }

    fn persist(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&self.documents) {
                error!("Failed to persist documents: {:#}", e);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_value_adds_timestamp() {
        let doc = StoredDocument {
            payload: json!({ "notes": "x", "sheets": [] }),
            updated_at: 42,
        };
        assert_eq!(
            record_value(&doc),
            json!({ "notes": "x", "sheets": [], "updatedAt": 42 })
        );
    }

    #[test]
    fn test_new_loads_snapshot() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("documents.json");
        let mut table = DocumentTable::new();
        table.overwrite(&UserId::new("alice").unwrap(), json!({}), 1);
        SnapshotStorage::new(&path).save(&table).unwrap();

        let server = StoreServer::new(
            Some(SnapshotStorage::new(&path)),
            tally_core::ManualClock::new(0),
        )
        .unwrap();
        assert_eq!(server.document_count(), 1);
        assert_eq!(server.connection_count(), 0);
    }
}
