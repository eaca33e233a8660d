//! `RemoteStore` over a WebSocket connection to `tally-store`.
//!
//! One connection is opened lazily and shared by every request. Responses
//! are matched to requests by id; `changed` pushes are routed to the live
//! subscriptions for that user. When the socket drops, in-flight requests
//! fail with `RemoteError::Closed`, subscriptions end, and the next request
//! reconnects.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tally_core::protocol::{ClientMessage, MAX_MESSAGE_SIZE, RequestId, ServerMessage};
use tally_core::remote::Result;
use tally_core::{
    ApplicationState, RemoteChange, RemoteError, RemoteRecord, RemoteStore, RemoteSubscription,
    SaveOutcome, UserId,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Default time to wait for a response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Watchers = HashMap<UserId, Vec<(u64, mpsc::UnboundedSender<RemoteChange>)>>;

/// An open connection and its routing tables.
struct Connection {
    write: tokio::sync::Mutex<futures::stream::SplitSink<Socket, Message>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>,
    watchers: Mutex<Watchers>,
    next_id: AtomicU64,
    closed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    async fn open(url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        info!("Connected to {}", url);

        let (write, read) = ws_stream.split();
        let conn = Arc::new(Self {
            write: tokio::sync::Mutex::new(write),
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            read_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        let address = url.to_string();
        let task = tokio::spawn(async move {
            Self::read_loop(address, read, weak).await;
        });
        *lock(&conn.read_task) = Some(task);
        Ok(conn)
    }

    async fn read_loop(
        address: String,
        mut read: futures::stream::SplitStream<Socket>,
        conn: Weak<Connection>,
    ) {
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", address);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", address);
                        }
                        _ => error!("WebSocket error on {}: {}", address, e),
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", address);
                    break;
                }
            };

            let Some(live) = conn.upgrade() else { break };
            match ServerMessage::from_json(&text) {
                Ok(message) => live.route(message),
                Err(e) => warn!("Dropping invalid message from {}: {}", address, e),
            }
        }

        if let Some(conn) = conn.upgrade() {
            conn.shut();
        }
    }

    fn route(&self, message: ServerMessage) {
        let id = match &message {
            ServerMessage::Loaded { id, .. }
            | ServerMessage::Saved { id, .. }
            | ServerMessage::Rejected { id, .. } => Some(*id),
            ServerMessage::Error { id, message: text } => {
                if id.is_none() {
                    warn!("Store reported an error: {}", text);
                }
                *id
            }
            ServerMessage::Changed { user_id, record } => {
                let change = match record.clone().map(RemoteRecord::from_value).transpose() {
                    Ok(Some(record)) => RemoteChange::Updated(record),
                    Ok(None) => RemoteChange::Absent,
                    Err(e) => {
                        warn!("Ignoring undecodable document for {}: {}", user_id, e);
                        return;
                    }
                };
                let mut watchers = lock(&self.watchers);
                if let Some(subs) = watchers.get_mut(user_id) {
                    subs.retain(|(_, tx)| tx.send(change.clone()).is_ok());
                }
                return;
            }
        };

        let waiter = id.and_then(|id| lock(&self.pending).remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!("Response for unknown request {:?}", id),
        }
    }

    /// Fail every waiter and end every subscription.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.pending).clear();
        lock(&self.watchers).clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let json = message.to_json();
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(RemoteError::Protocol(format!(
                "Message too large: {} bytes",
                json.len()
            )));
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))
    }

    async fn request(
        &self,
        make: impl FnOnce(RequestId) -> ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.send(&make(id)).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(RemoteError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(RemoteError::Unavailable(format!(
                    "No response within {:?}",
                    timeout
                )))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.read_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn encode(state: &ApplicationState) -> Result<serde_json::Value> {
    serde_json::to_value(state).map_err(|e| RemoteError::Protocol(e.to_string()))
}

fn unexpected(message: ServerMessage) -> RemoteError {
    match message {
        ServerMessage::Error { message, .. } => RemoteError::Server(message),
        other => RemoteError::Protocol(format!("Unexpected response: {:?}", other)),
    }
}

/// Remote store client for a `tally-store` server.
pub struct WsRemote {
    url: String,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<Arc<Connection>>>,
    next_watcher: AtomicU64,
}

impl WsRemote {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            conn: tokio::sync::Mutex::new(None),
            next_watcher: AtomicU64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The open connection, reconnecting if the last one dropped.
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
            debug!("Connection to {} dropped, reconnecting", self.url);
        }

        let conn = tokio::time::timeout(self.timeout, Connection::open(&self.url))
            .await
            .map_err(|_| RemoteError::Unavailable(format!("Connect timed out: {}", self.url)))??;
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

#[async_trait]
impl RemoteStore for WsRemote {
    async fn load(&self, user: &UserId) -> Result<Option<RemoteRecord>> {
        let conn = self.connection().await?;
        let response = conn
            .request(
                |id| ClientMessage::Load {
                    id,
                    user_id: user.clone(),
                },
                self.timeout,
            )
            .await?;

        match response {
            ServerMessage::Loaded { record, .. } => {
                Ok(record.map(RemoteRecord::from_value).transpose()?)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn save(
        &self,
        user: &UserId,
        state: &ApplicationState,
        timestamp: i64,
    ) -> Result<SaveOutcome> {
        let state = encode(state)?;
        let conn = self.connection().await?;
        let response = conn
            .request(
                |id| ClientMessage::Save {
                    id,
                    user_id: user.clone(),
                    state,
                    timestamp,
                },
                self.timeout,
            )
            .await?;

        match response {
            ServerMessage::Saved { timestamp, .. } => Ok(SaveOutcome::Saved(timestamp)),
            ServerMessage::Rejected {
                remote_updated_at, ..
            } => Ok(SaveOutcome::Stale { remote_updated_at }),
            other => Err(unexpected(other)),
        }
    }

    async fn force_save(&self, user: &UserId, state: &ApplicationState) -> Result<i64> {
        let state = encode(state)?;
        let conn = self.connection().await?;
        let response = conn
            .request(
                |id| ClientMessage::ForceSave {
                    id,
                    user_id: user.clone(),
                    state,
                },
                self.timeout,
            )
            .await?;

        match response {
            ServerMessage::Saved { timestamp, .. } => Ok(timestamp),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, user: &UserId) -> Result<RemoteSubscription> {
        let conn = self.connection().await?;
        let watcher_id = self.next_watcher.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(&conn);
        let owner = user.clone();
        let (tx, subscription) = RemoteSubscription::channel(move || {
            let Some(conn) = weak.upgrade() else { return };
            let last = {
                let mut watchers = lock(&conn.watchers);
                match watchers.get_mut(&owner) {
                    Some(subs) => {
                        subs.retain(|(id, _)| *id != watcher_id);
                        let last = subs.is_empty();
                        if last {
                            watchers.remove(&owner);
                        }
                        last
                    }
                    None => false,
                }
            };
            if last && !conn.is_closed() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let message = ClientMessage::Unsubscribe { user_id: owner };
                        if let Err(e) = conn.send(&message).await {
                            debug!("Unsubscribe not sent: {}", e);
                        }
                    });
                }
            }
        });

        lock(&conn.watchers)
            .entry(user.clone())
            .or_default()
            .push((watcher_id, tx));
        conn.send(&ClientMessage::Subscribe {
            user_id: user.clone(),
        })
        .await?;
        debug!("Subscribed to {}", user);
        Ok(subscription)
    }
}
