//! Local Durable Store: the three local slots that back the sync engine.
//!
//! - primary: the whole state, used only while no user is signed in
//! - backup: the last local snapshot plus whether it reached the cloud
//! - pending: the write the engine intends to perform next
//!
//! Slots live in a synchronous [`KeyValueStore`] so they can be flushed from
//! shutdown paths where async work is not reliable. Persistence failures are
//! logged and swallowed; unreadable slots are treated as absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::warn;

use crate::clock::Clock;
use crate::model::ApplicationState;
use crate::schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Synchronous string key-value storage (browser local storage, files, memory).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// In-memory key-value store for tests.
///
/// Wrap in `Arc` to share one "disk" between engine instances, which is how
/// tests simulate a reload.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: RwLock<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `set` fail with [`StoreError::QuotaExceeded`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Keys written so far, in order (successful writes only).
    pub fn write_log(&self) -> Vec<String> {
        self.writes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded);
        }
        self.insert_raw(key, value);
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Last local snapshot and whether it is known to exist remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub state: ApplicationState,
    pub timestamp: i64,
    /// `false` means this snapshot may not exist remotely yet
    pub saved_to_cloud: bool,
}

/// The write the engine intends to perform next.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChangeRecord {
    pub state: ApplicationState,
    pub timestamp: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBackup {
    state: Value,
    timestamp: i64,
    saved_to_cloud: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPending {
    state: Value,
    timestamp: i64,
}

/// Slot keys derived from a prefix.
#[derive(Debug, Clone)]
struct SlotKeys {
    primary: String,
    backup: String,
    pending: String,
}

impl SlotKeys {
    fn new(prefix: &str) -> Self {
        Self {
            primary: format!("{prefix}:data"),
            backup: format!("{prefix}:backup"),
            pending: format!("{prefix}:pending"),
        }
    }
}

/// Typed access to the primary, backup and pending slots.
pub struct LocalStore<S> {
    kv: S,
    keys: SlotKeys,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> LocalStore<S> {
    pub fn new(kv: S, key_prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            keys: SlotKeys::new(key_prefix),
            clock,
        }
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }

    // ==================== backup slot ====================

    /// Overwrite the backup slot with `state` stamped now.
    pub fn save_backup(&self, state: &ApplicationState, saved_to_cloud: bool) {
        let record = BackupRecord {
            state: state.clone(),
            timestamp: self.clock.now_ms(),
            saved_to_cloud,
        };
        self.write_slot(&self.keys.backup, &record);
    }

    pub fn load_backup(&self) -> Option<BackupRecord> {
        let raw: RawBackup = self.read_slot(&self.keys.backup)?;
        let state = self.upgrade_slot(&self.keys.backup, raw.state)?;
        Some(BackupRecord {
            state,
            timestamp: raw.timestamp,
            saved_to_cloud: raw.saved_to_cloud,
        })
    }

    pub fn clear_backup(&self) {
        self.remove_slot(&self.keys.backup);
    }

    // ==================== pending slot ====================

    pub fn save_pending_changes(&self, state: &ApplicationState) {
        let record = PendingChangeRecord {
            state: state.clone(),
            timestamp: self.clock.now_ms(),
        };
        self.write_slot(&self.keys.pending, &record);
    }

    pub fn load_pending_changes(&self) -> Option<PendingChangeRecord> {
        let raw: RawPending = self.read_slot(&self.keys.pending)?;
        let state = self.upgrade_slot(&self.keys.pending, raw.state)?;
        Some(PendingChangeRecord {
            state,
            timestamp: raw.timestamp,
        })
    }

    pub fn clear_pending_changes(&self) {
        self.remove_slot(&self.keys.pending);
    }

    // ==================== primary slot ====================

    /// Save the whole state to the primary slot (signed-out mode only).
    pub fn save_data(&self, state: &ApplicationState) {
        self.write_slot(&self.keys.primary, state);
    }

    pub fn load_data(&self) -> Option<ApplicationState> {
        let raw: Value = self.read_slot(&self.keys.primary)?;
        self.upgrade_slot(&self.keys.primary, raw)
    }

    pub fn clear_data(&self) {
        self.remove_slot(&self.keys.primary);
    }

    // ==================== helpers ====================

    fn write_slot<T: Serialize>(&self, key: &str, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.kv.set(key, &json) {
            warn!("Failed to persist {} ({} bytes): {}", key, json.len(), e);
        }
    }

    fn read_slot<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let text = match self.kv.get(key) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt {} slot: {}", key, e);
                None
            }
        }
    }

    fn upgrade_slot(&self, key: &str, raw: Value) -> Option<ApplicationState> {
        match schema::upgrade(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Ignoring unreadable state in {} slot: {}", key, e);
                None
            }
        }
    }

    fn remove_slot(&self, key: &str) {
        if let Err(e) = self.kv.remove(key) {
            warn!("Failed to clear {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (LocalStore<Arc<MemoryStore>>, Arc<MemoryStore>, Arc<ManualClock>) {
        let kv = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(5_000);
        let local = LocalStore::new(Arc::clone(&kv), "tally", clock.clone());
        (local, kv, clock)
    }

    fn state_with_notes(notes: &str) -> ApplicationState {
        ApplicationState {
            notes: notes.to_string(),
            ..ApplicationState::empty()
        }
    }

    // ==================== backup ====================

    #[test]
    fn test_backup_roundtrip_is_stamped_now() {
        let (local, _kv, clock) = store();
        clock.set(7_000);
        local.save_backup(&state_with_notes("a"), false);

        let backup = local.load_backup().unwrap();
        assert_eq!(backup.state.notes, "a");
        assert_eq!(backup.timestamp, 7_000);
        assert!(!backup.saved_to_cloud);
    }

    #[test]
    fn test_backup_is_overwritten_not_appended() {
        let (local, kv, _clock) = store();
        local.save_backup(&state_with_notes("a"), false);
        local.save_backup(&state_with_notes("b"), true);

        let backup = local.load_backup().unwrap();
        assert_eq!(backup.state.notes, "b");
        assert!(backup.saved_to_cloud);
        assert!(kv.raw("tally:backup").unwrap().contains("\"savedToCloud\":true"));
    }

    #[test]
    fn test_clear_backup() {
        let (local, _kv, _clock) = store();
        local.save_backup(&state_with_notes("a"), false);
        local.clear_backup();
        assert!(local.load_backup().is_none());
    }

    // ==================== pending ====================

    #[test]
    fn test_pending_roundtrip_and_clear() {
        let (local, _kv, _clock) = store();
        assert!(local.load_pending_changes().is_none());

        local.save_pending_changes(&state_with_notes("next"));
        let pending = local.load_pending_changes().unwrap();
        assert_eq!(pending.state.notes, "next");
        assert_eq!(pending.timestamp, 5_000);

        local.clear_pending_changes();
        assert!(local.load_pending_changes().is_none());
    }

    // ==================== primary ====================

    #[test]
    fn test_primary_slot_is_independent() {
        let (local, _kv, _clock) = store();
        local.save_data(&state_with_notes("primary"));
        local.save_backup(&state_with_notes("backup"), false);

        assert_eq!(local.load_data().unwrap().notes, "primary");
        local.clear_data();
        assert!(local.load_data().is_none());
        assert_eq!(local.load_backup().unwrap().state.notes, "backup");
    }

    #[test]
    fn test_primary_slot_upgrades_legacy_documents() {
        let (local, kv, _clock) = store();
        kv.insert_raw("tally:data", r#"{"sheets":[{"id":"s1","name":"Old"}]}"#);

        let state = local.load_data().unwrap();
        assert_eq!(state.sheets[0].name, "Old");
        assert!(state.sheets[0].marks.is_empty());
    }

    // ==================== failure handling ====================

    #[test]
    fn test_corrupt_slots_read_as_absent() {
        let (local, kv, _clock) = store();
        kv.insert_raw("tally:backup", "{not json");
        kv.insert_raw("tally:pending", r#"{"state":{"schemaVersion":42},"timestamp":1}"#);
        kv.insert_raw("tally:data", "[]");

        assert!(local.load_backup().is_none());
        assert!(local.load_pending_changes().is_none());
        assert!(local.load_data().is_none());
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let (local, kv, _clock) = store();
        kv.set_fail_writes(true);

        local.save_backup(&state_with_notes("lost"), false);
        local.save_pending_changes(&state_with_notes("lost"));

        assert!(local.load_backup().is_none());
        assert!(kv.write_log().is_empty());
    }

    #[test]
    fn test_custom_prefix() {
        let kv = Arc::new(MemoryStore::new());
        let local = LocalStore::new(Arc::clone(&kv), "other", ManualClock::new(0));
        local.save_data(&ApplicationState::empty());
        assert!(kv.raw("other:data").is_some());
        assert!(kv.raw("tally:data").is_none());
    }
}
