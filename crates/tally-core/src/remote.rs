//! Remote Store Adapter contract.
//!
//! A remote document store keyed by user id. Each document is the
//! application payload plus an `updatedAt` timestamp assigned by the writer.
//! The only conflict rule is last-writer-wins on that timestamp, enforced
//! atomically by the store.
//!
//! Implementations:
//! - `MemoryRemote` - in-process store for tests and offline simulation
//! - `WsRemote` (in tally-cli) - talks to a `tally-store` server

use async_trait::async_trait;
use futures::Stream;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::model::{ApplicationState, UserId};
use crate::schema::{self, SchemaError};

const UPDATED_AT_FIELD: &str = "updatedAt";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Closed,

    #[error("Server error: {0}")]
    Server(String),
}

impl From<SchemaError> for RemoteError {
    fn from(err: SchemaError) -> Self {
        RemoteError::Protocol(format!("invalid remote document: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// A remote document: the application payload plus its write timestamp.
///
/// On the wire the two are flattened into one JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub state: ApplicationState,
    /// Absent on documents written by builds that did not stamp them
    pub updated_at: Option<i64>,
}

impl RemoteRecord {
    pub fn new(state: ApplicationState, updated_at: i64) -> Self {
        Self {
            state,
            updated_at: Some(updated_at),
        }
    }

    /// Decode a flattened document, upgrading older payloads.
    pub fn from_value(value: Value) -> std::result::Result<Self, SchemaError> {
        let Value::Object(mut doc) = value else {
            return Err(SchemaError::NotAnObject);
        };
        let updated_at = doc.remove(UPDATED_AT_FIELD).and_then(|v| v.as_i64());
        let state = schema::upgrade(Value::Object(doc))?;
        Ok(Self { state, updated_at })
    }

    /// Encode as a flattened document.
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(&self.state).unwrap_or(Value::Null);
        if let (Value::Object(doc), Some(ts)) = (&mut value, self.updated_at) {
            doc.insert(UPDATED_AT_FIELD.to_string(), Value::from(ts));
        }
        value
    }
}

impl Serialize for RemoteRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Stored at this timestamp.
    Saved(i64),
    /// The stored document was at least as new; nothing was written.
    Stale { remote_updated_at: Option<i64> },
}

/// One push from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Updated(RemoteRecord),
    /// The document does not exist (or was removed).
    Absent,
}

/// Live stream of remote changes for one user. Unsubscribes when dropped.
pub struct RemoteSubscription {
    rx: mpsc::UnboundedReceiver<RemoteChange>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemoteSubscription {
    /// Create a subscription and the sender that feeds it.
    pub fn channel(
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> (mpsc::UnboundedSender<RemoteChange>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        };
        (tx, sub)
    }

    /// Wait for the next change. `None` once the store side has gone away.
    pub async fn next_change(&mut self) -> Option<RemoteChange> {
        self.rx.recv().await
    }
}

impl Stream for RemoteSubscription {
    type Item = RemoteChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

/// Timestamp-aware document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Point read.
    async fn load(&self, user: &UserId) -> Result<Option<RemoteRecord>>;

    /// Atomic conditional write: stores only if `timestamp` is strictly
    /// greater than the stored `updatedAt`.
    async fn save(
        &self,
        user: &UserId,
        state: &ApplicationState,
        timestamp: i64,
    ) -> Result<SaveOutcome>;

    /// Unconditional overwrite stamped with the store's `now`.
    async fn force_save(&self, user: &UserId, state: &ApplicationState) -> Result<i64>;

    /// Live pushes on every write to the document, including our own.
    async fn subscribe(&self, user: &UserId) -> Result<RemoteSubscription>;
}

// ============================================================================
// Document table
// ============================================================================

/// A stored document with its write timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument<P> {
    pub payload: P,
    pub updated_at: i64,
}

/// Per-user documents with last-writer-wins conditional writes.
///
/// Callers provide the atomicity (a lock or a single owning task); the
/// table only encodes the comparison.
#[derive(Debug, Clone)]
pub struct DocumentTable<P> {
    docs: HashMap<UserId, StoredDocument<P>>,
}

impl<P> Default for DocumentTable<P> {
    fn default() -> Self {
        Self {
            docs: HashMap::new(),
        }
    }
}

impl<P> DocumentTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &UserId) -> Option<&StoredDocument<P>> {
        self.docs.get(user)
    }

    /// Store `payload` only if `timestamp` is newer than the stored one.
    pub fn write_if_newer(&mut self, user: &UserId, payload: P, timestamp: i64) -> SaveOutcome {
        if let Some(existing) = self.docs.get(user) {
            if timestamp <= existing.updated_at {
                return SaveOutcome::Stale {
                    remote_updated_at: Some(existing.updated_at),
                };
            }
        }
        self.overwrite(user, payload, timestamp);
        SaveOutcome::Saved(timestamp)
    }

    pub fn overwrite(&mut self, user: &UserId, payload: P, timestamp: i64) {
        self.docs.insert(
            user.clone(),
            StoredDocument {
                payload,
                updated_at: timestamp,
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &StoredDocument<P>)> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

// ============================================================================
// In-memory remote
// ============================================================================

type Subscribers = HashMap<UserId, Vec<(u64, mpsc::UnboundedSender<RemoteChange>)>>;

#[derive(Default)]
struct MemoryInner {
    table: DocumentTable<ApplicationState>,
    subscribers: Subscribers,
    next_subscriber: u64,
}

impl MemoryInner {
    fn current(&self, user: &UserId) -> RemoteChange {
        match self.table.get(user) {
            Some(doc) => RemoteChange::Updated(RemoteRecord::new(doc.payload.clone(), doc.updated_at)),
            None => RemoteChange::Absent,
        }
    }

    fn notify(&mut self, user: &UserId) {
        let change = self.current(user);
        if let Some(subs) = self.subscribers.get_mut(user) {
            subs.retain(|(_, tx)| tx.send(change.clone()).is_ok());
        }
    }
}

/// In-process remote store shared by every session holding the same `Arc`.
///
/// Supports going offline and adding latency so tests can drive the
/// failure and interleaving paths.
pub struct MemoryRemote {
    inner: Arc<Mutex<MemoryInner>>,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    latency_ms: AtomicU64,
    save_calls: AtomicUsize,
    force_save_calls: AtomicUsize,
}

impl MemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            clock,
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            save_calls: AtomicUsize::new(0),
            force_save_calls: AtomicUsize::new(0),
        }
    }

    /// While offline every operation fails with `RemoteError::Unavailable`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay applied before each read or write.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Conditional writes attempted, including failed and rejected ones.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn force_save_calls(&self) -> usize {
        self.force_save_calls.load(Ordering::SeqCst)
    }

    /// Current document, bypassing the online switch.
    pub fn document(&self, user: &UserId) -> Option<RemoteRecord> {
        match self.lock().current(user) {
            RemoteChange::Updated(record) => Some(record),
            RemoteChange::Absent => None,
        }
    }

    /// Write a document directly and notify subscribers, as another device would.
    pub fn put(&self, user: &UserId, state: ApplicationState, updated_at: i64) {
        let mut inner = self.lock();
        inner.table.overwrite(user, state, updated_at);
        inner.notify(user);
    }

    pub fn subscriber_count(&self, user: &UserId) -> usize {
        self.lock().subscribers.get(user).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("offline".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn load(&self, user: &UserId) -> Result<Option<RemoteRecord>> {
        self.round_trip().await?;
        Ok(self.document(user))
    }

    async fn save(
        &self,
        user: &UserId,
        state: &ApplicationState,
        timestamp: i64,
    ) -> Result<SaveOutcome> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        let mut inner = self.lock();
        let outcome = inner.table.write_if_newer(user, state.clone(), timestamp);
        match outcome {
            SaveOutcome::Saved(_) => inner.notify(user),
            SaveOutcome::Stale { remote_updated_at } => {
                debug!(
                    "Rejected write for {} at {} (stored {:?})",
                    user, timestamp, remote_updated_at
                );
            }
        }
        Ok(outcome)
    }

    async fn force_save(&self, user: &UserId, state: &ApplicationState) -> Result<i64> {
        self.force_save_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        let timestamp = self.clock.now_ms();
        let mut inner = self.lock();
        inner.table.overwrite(user, state.clone(), timestamp);
        inner.notify(user);
        Ok(timestamp)
    }

    async fn subscribe(&self, user: &UserId) -> Result<RemoteSubscription> {
        self.round_trip().await?;

        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        let weak: Weak<Mutex<MemoryInner>> = Arc::downgrade(&self.inner);
        let owner = user.clone();
        let (tx, sub) = RemoteSubscription::channel(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(subs) = inner.subscribers.get_mut(&owner) {
                    subs.retain(|(i, _)| *i != id);
                }
            }
        });

        let _ = tx.send(inner.current(user));
        inner.subscribers.entry(user.clone()).or_default().push((id, tx));
        Ok(sub)
    }
}
