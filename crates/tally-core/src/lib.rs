//! tally-core: offline-first state sync for the tally budget tracker.
//!
//! This crate provides:
//! - The budget data model, versioned schema upgrade and reducer
//! - Local durable slots (primary, backup, pending) over a key-value store
//! - The remote document contract with last-writer-wins conditional writes
//! - `SyncEngine`, the state machine reconciling local and remote state
//! - `SyncService`, a tokio task hosting the engine behind `SyncHandle`
//! - The WebSocket wire protocol spoken with `tally-store`

pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod guards;
pub mod model;
pub mod protocol;
pub mod reducer;
pub mod remote;
pub mod schema;
pub mod service;
pub mod startup;
pub mod store;
pub mod transfer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::{Phase, SyncCursor, SyncEngine, SyncStatus};
pub use events::{EventBus, IgnoreReason, StartupSource, Subscription, SyncEvent};
pub use guards::UnloadDecision;
pub use model::{ApplicationState, Fingerprint, UserId, UserIdError};
pub use reducer::{Action, reduce};
pub use remote::{
    DocumentTable, MemoryRemote, RemoteChange, RemoteError, RemoteRecord, RemoteStore,
    RemoteSubscription, SaveOutcome,
};
pub use service::{ServiceError, SyncHandle, SyncService};
pub use store::{BackupRecord, KeyValueStore, LocalStore, MemoryStore, PendingChangeRecord, StoreError};
pub use transfer::{ImportError, export_json, import_json};
