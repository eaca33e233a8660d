//! tally-store library: the remote document store behind tally clients.
//!
//! Exposed as a library so integration tests can run a server in-process.

pub mod connection;
pub mod persistence;
pub mod server;

pub use connection::{ClientConnection, ConnId, ConnectionEvent};
pub use persistence::{PersistedDocument, Snapshot, SnapshotStorage};
pub use server::StoreServer;
