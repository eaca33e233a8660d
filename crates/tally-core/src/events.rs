//! Sync event notifications.
//!
//! `SyncEvent` describes what the engine decided and why. `EventBus` fans
//! events out to callbacks; hold the returned `Subscription` to keep
//! receiving them.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Which branch of startup resolution produced the initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StartupSource {
    /// Unsaved backup newer than remote
    Backup,
    /// Pending change newer than remote
    Pending,
    Remote,
    /// Anonymous primary snapshot promoted to the new account
    Migration,
    Empty,
    /// No identity: primary snapshot loaded directly
    Anonymous,
    /// Remote unreachable: best local artifact adopted without force-save
    Offline,
}

/// Why an inbound push was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IgnoreReason {
    /// Startup resolution has not finished
    NotReady,
    /// Still inside the warm-up window after subscribing
    WarmingUp,
    /// A local write is queued or in flight
    Busy,
    /// Not newer than the cursor by more than the echo margin
    NotNewer,
    /// Same content as the cursor
    Unchanged,
    /// Remote document was deleted or carries no timestamp
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    StartupResolved {
        source: StartupSource,
    },
    /// Conditional write stored at this timestamp.
    WriteSucceeded {
        timestamp: i64,
    },
    /// Conditional write lost to a newer remote document.
    WriteRejected {
        #[serde(rename = "remoteUpdatedAt")]
        remote_updated_at: Option<i64>,
    },
    WriteFailed {
        message: String,
    },
    /// A remote push replaced local state.
    RemoteAccepted {
        timestamp: i64,
    },
    RemoteIgnored {
        reason: IgnoreReason,
    },
    /// Backup and pending records were flushed by the unload guard.
    LocalFlushed,
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
