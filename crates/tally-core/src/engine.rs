//! SyncEngine: the offline-first state machine.
//!
//! The engine owns the current `ApplicationState` and decides when local
//! changes go to the remote store and when remote pushes replace local state.
//! It performs no I/O against the remote itself: callers ask it for due
//! writes and feed it results and pushes. Local slots are written
//! synchronously through `LocalStore`.
//!
//! Lifecycle per identity session: `Uninitialized -> Loading -> Ready`.
//!
//! Outbound (local change -> remote):
//! 1. skip when the state matches the cursor and nothing is queued
//! 2. write backup (unsaved) and pending record immediately
//! 3. replace the single queued write and restart the debounce deadline
//! 4. at the deadline, hand out one conditional write with a fresh timestamp
//! 5. on success advance the cursor; mark the backup saved and drop the
//!    pending record unless a newer change is already queued
//!
//! Inbound (remote push -> local) is accepted only when startup is done, the
//! warm-up window has passed, no write is queued or in flight, the push is
//! newer than the cursor by more than the echo margin, and its content
//! differs from the cursor. A push refused only because the engine was busy
//! is replayed once it is idle again.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::events::{EventBus, IgnoreReason, StartupSource, SyncEvent};
use crate::guards::{UnloadDecision, WarmupGate};
use crate::model::{ApplicationState, Fingerprint, UserId};
use crate::reducer::{Action, reduce};
use crate::remote::{RemoteChange, RemoteError, RemoteRecord, SaveOutcome};
use crate::startup::{self, Followup, LocalArtifacts};
use crate::store::{KeyValueStore, LocalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
}

/// What the engine last knew to be on the remote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCursor {
    pub fingerprint: Option<Fingerprint>,
    pub timestamp: Option<i64>,
}

impl SyncCursor {
    fn set(&mut self, state: &ApplicationState, timestamp: i64) {
        self.fingerprint = Some(state.fingerprint());
        self.timestamp = Some(timestamp);
    }

    fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprint.as_ref() == Some(fingerprint)
    }
}

/// Snapshot of engine bookkeeping for display and waiting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: Phase,
    pub identity: Option<UserId>,
    /// Local changes that are not confirmed remotely
    pub unsaved: bool,
    pub write_queued: bool,
    pub write_in_flight: bool,
    pub last_synced_at: Option<i64>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Ready with nothing queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Ready && !self.write_queued && !self.write_in_flight
    }
}

/// A conditional write the caller must perform.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub epoch: u64,
    pub user: UserId,
    pub state: ApplicationState,
    pub timestamp: i64,
}

/// An unconditional write required by startup resolution.
#[derive(Debug, Clone)]
pub struct ForceSaveRequest {
    pub epoch: u64,
    pub user: UserId,
    pub state: ApplicationState,
    pub source: StartupSource,
}

#[derive(Debug, Clone)]
struct InFlight {
    fingerprint: Fingerprint,
    timestamp: i64,
}

pub struct SyncEngine<S> {
    config: SyncConfig,
    local: LocalStore<S>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,

    phase: Phase,
    identity: Option<UserId>,
    epoch: u64,

    state: ApplicationState,
    cursor: SyncCursor,
    /// Single-slot coalesced write target
    desired: Option<ApplicationState>,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    unsaved: bool,

    warmup: WarmupGate,
    deferred_push: Option<RemoteRecord>,
    last_error: Option<String>,
}

impl<S: KeyValueStore> SyncEngine<S> {
    pub fn new(config: SyncConfig, kv: S, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        let local = LocalStore::new(kv, &config.key_prefix, Arc::clone(&clock));
        Self {
            config,
            local,
            clock,
            events,
            phase: Phase::Uninitialized,
            identity: None,
            epoch: 0,
            state: ApplicationState::empty(),
            cursor: SyncCursor::default(),
            desired: None,
            deadline: None,
            in_flight: None,
            unsaved: false,
            warmup: WarmupGate::default(),
            deferred_push: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &ApplicationState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> Option<&UserId> {
        self.identity.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn local(&self) -> &LocalStore<S> {
        &self.local
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            phase: self.phase,
            identity: self.identity.clone(),
            unsaved: self.unsaved,
            write_queued: self.desired.is_some(),
            write_in_flight: self.in_flight.is_some(),
            last_synced_at: self.cursor.timestamp,
            last_error: self.last_error.clone(),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Tear down the current session and start loading for `identity`.
    ///
    /// Returns the new session epoch; results tagged with an older epoch
    /// are discarded.
    pub fn begin_session(&mut self, identity: Option<UserId>) -> u64 {
        self.teardown();
        self.identity = identity;
        self.phase = Phase::Loading;
        self.cursor = SyncCursor::default();
        self.unsaved = false;
        self.last_error = None;
        self.epoch
    }

    /// Drop queued work and stop admitting callbacks from the current session.
    pub fn teardown(&mut self) {
        self.epoch += 1;
        self.desired = None;
        self.deadline = None;
        self.in_flight = None;
        self.deferred_push = None;
        self.warmup.reset();
        self.phase = Phase::Uninitialized;
    }

    /// Signed-out startup: the primary slot is the whole truth.
    pub fn load_anonymous(&mut self) {
        self.state = self.local.load_data().unwrap_or_default();
        self.phase = Phase::Ready;
        info!("Loaded local data ({} sheets)", self.state.sheets.len());
        self.events.emit(SyncEvent::StartupResolved {
            source: StartupSource::Anonymous,
        });
    }

    /// Resolve the initial state from the remote read and local slots.
    ///
    /// Returns a force-save the caller must perform and report back through
    /// [`SyncEngine::on_force_save_result`]; the engine stays `Loading` until then.
    pub fn apply_startup(
        &mut self,
        remote: Result<Option<RemoteRecord>, RemoteError>,
    ) -> Option<ForceSaveRequest> {
        let user = self.identity.clone()?;
        let local = LocalArtifacts {
            backup: self.local.load_backup(),
            pending: self.local.load_pending_changes(),
            primary: self.local.load_data(),
        };

        let resolution = match remote {
            Ok(record) => startup::resolve(record, local, self.clock.now_ms()),
            Err(e) => {
                warn!("Remote unavailable at startup, using local data: {}", e);
                self.last_error = Some(e.to_string());
                startup::resolve_offline(local)
            }
        };

        info!("Startup resolved from {:?} for {}", resolution.source, user);
        self.state = resolution.state;
        self.local.clear_data();
        self.events.emit(SyncEvent::StartupResolved {
            source: resolution.source,
        });

        match resolution.followup {
            Followup::AdoptRemote { timestamp } => {
                self.cursor.set(&self.state, timestamp);
                self.local.clear_backup();
                self.local.clear_pending_changes();
                self.phase = Phase::Ready;
                None
            }
            Followup::ForceSave => {
                if resolution.source == StartupSource::Migration {
                    // primary slot is already gone; keep a copy until the push lands
                    self.local.save_backup(&self.state, false);
                }
                self.unsaved = true;
                Some(ForceSaveRequest {
                    epoch: self.epoch,
                    user,
                    state: self.state.clone(),
                    source: resolution.source,
                })
            }
            Followup::Fresh => {
                self.phase = Phase::Ready;
                None
            }
            Followup::Offline { persist } => {
                if persist {
                    self.local.save_backup(&self.state, false);
                    self.unsaved = true;
                }
                self.phase = Phase::Ready;
                None
            }
        }
    }

    pub fn on_force_save_result(
        &mut self,
        epoch: u64,
        source: StartupSource,
        result: Result<i64, RemoteError>,
    ) {
        if epoch != self.epoch {
            debug!("Dropping force-save result from stale session");
            return;
        }

        match result {
            Ok(timestamp) => {
                info!("Pushed {:?} state to remote at {}", source, timestamp);
                self.cursor.set(&self.state, timestamp);
                match source {
                    StartupSource::Pending => self.local.clear_pending_changes(),
                    _ => self.local.save_backup(&self.state, true),
                }
                self.unsaved = false;
                self.last_error = None;
                self.events.emit(SyncEvent::WriteSucceeded { timestamp });
            }
            Err(e) => {
                warn!("Failed to push {:?} state, keeping it local: {}", source, e);
                self.last_error = Some(e.to_string());
                self.events.emit(SyncEvent::WriteFailed {
                    message: e.to_string(),
                });
            }
        }
        self.phase = Phase::Ready;
    }

    /// The live subscription is established; start the warm-up window.
    pub fn on_subscribed(&mut self, now: Instant) {
        self.warmup.arm(now, self.config.warmup);
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Apply an action and run the outbound flow on the result.
    pub fn dispatch(&mut self, action: Action, now: Instant) {
        let next = reduce(&self.state, action);
        self.set_state(next, now);
    }

    /// Replace the state wholesale (import).
    pub fn import_data(&mut self, state: ApplicationState, now: Instant) {
        self.dispatch(
            Action::ReplaceState {
                state: Box::new(state),
            },
            now,
        );
    }

    fn set_state(&mut self, next: ApplicationState, now: Instant) {
        self.state = next;
        if self.phase != Phase::Ready {
            return;
        }

        if self.identity.is_none() {
            self.local.save_data(&self.state);
            return;
        }

        let fingerprint = self.state.fingerprint();
        if self.cursor.matches(&fingerprint) && self.desired.is_none() && self.in_flight.is_none() {
            debug!("State matches last sync, nothing to write");
            return;
        }

        self.local.save_backup(&self.state, false);
        self.local.save_pending_changes(&self.state);
        self.unsaved = true;
        self.desired = Some(self.state.clone());
        self.deadline = Some(now + self.config.debounce);
    }

    /// When the queued write becomes due. `None` while a write is in flight.
    pub fn next_write_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() || self.desired.is_none() {
            return None;
        }
        self.deadline
    }

    /// Take the queued write if its deadline has passed.
    pub fn take_due_write(&mut self, now: Instant) -> Option<WriteRequest> {
        if self.phase != Phase::Ready || self.in_flight.is_some() {
            return None;
        }
        let user = self.identity.clone()?;
        if self.deadline.is_none_or(|deadline| now < deadline) {
            return None;
        }
        let state = self.desired.take()?;
        self.deadline = None;

        let timestamp = self
            .clock
            .now_ms()
            .max(self.cursor.timestamp.unwrap_or(0) + 1);
        self.in_flight = Some(InFlight {
            fingerprint: state.fingerprint(),
            timestamp,
        });
        debug!("Writing state to remote at {}", timestamp);

        Some(WriteRequest {
            epoch: self.epoch,
            user,
            state,
            timestamp,
        })
    }

    pub fn on_write_result(
        &mut self,
        epoch: u64,
        result: Result<SaveOutcome, RemoteError>,
        now: Instant,
    ) {
        if epoch != self.epoch {
            debug!("Dropping write result from stale session");
            return;
        }
        let Some(written) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(SaveOutcome::Saved(timestamp)) => {
                info!("Saved to remote at {}", timestamp);
                self.cursor.fingerprint = Some(written.fingerprint);
                self.cursor.timestamp = Some(timestamp);
                if self.desired.is_none() {
                    self.local.save_backup(&self.state, true);
                    self.local.clear_pending_changes();
                    self.unsaved = false;
                }
                self.last_error = None;
                self.events.emit(SyncEvent::WriteSucceeded { timestamp });
            }
            Ok(SaveOutcome::Stale { remote_updated_at }) => {
                info!(
                    "Remote is newer ({:?} >= {}), write not saved",
                    remote_updated_at, written.timestamp
                );
                self.events
                    .emit(SyncEvent::WriteRejected { remote_updated_at });
            }
            Err(e) => {
                warn!("Remote write failed, changes kept locally: {}", e);
                self.last_error = Some(e.to_string());
                self.events.emit(SyncEvent::WriteFailed {
                    message: e.to_string(),
                });
            }
        }

        self.replay_deferred_push(now);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle a push from the live subscription.
    pub fn on_remote_change(&mut self, change: RemoteChange, now: Instant) {
        if let Err(reason) = self.admit(change, now) {
            debug!("Ignoring remote push: {:?}", reason);
            self.events.emit(SyncEvent::RemoteIgnored { reason });
        }
    }

    fn admit(&mut self, change: RemoteChange, now: Instant) -> Result<(), IgnoreReason> {
        if self.phase != Phase::Ready || self.identity.is_none() {
            return Err(IgnoreReason::NotReady);
        }
        if !self.warmup.is_open(now) {
            return Err(IgnoreReason::WarmingUp);
        }
        let RemoteChange::Updated(record) = change else {
            return Err(IgnoreReason::Empty);
        };
        let Some(timestamp) = record.updated_at else {
            return Err(IgnoreReason::Empty);
        };

        if self.desired.is_some() || self.in_flight.is_some() {
            self.deferred_push = Some(record);
            return Err(IgnoreReason::Busy);
        }
        self.deferred_push = None;

        let margin = self.config.echo_margin_ms;
        if self
            .cursor
            .timestamp
            .is_some_and(|synced| timestamp <= synced + margin)
        {
            return Err(IgnoreReason::NotNewer);
        }

        let fingerprint = record.state.fingerprint();
        if self.cursor.matches(&fingerprint) {
            return Err(IgnoreReason::Unchanged);
        }

        info!("Accepted remote state from {}", timestamp);
        self.state = record.state;
        self.cursor.fingerprint = Some(fingerprint);
        self.cursor.timestamp = Some(timestamp);
        self.local.clear_backup();
        self.local.clear_pending_changes();
        self.unsaved = false;
        self.events.emit(SyncEvent::RemoteAccepted { timestamp });
        Ok(())
    }

    fn replay_deferred_push(&mut self, now: Instant) {
        if self.desired.is_some() || self.in_flight.is_some() {
            return;
        }
        if let Some(record) = self.deferred_push.take() {
            debug!("Re-evaluating push deferred while busy");
            self.on_remote_change(RemoteChange::Updated(record), now);
        }
    }

    // ========================================================================
    // Unload guard
    // ========================================================================

    /// Synchronous part of leaving: flush local artifacts if the remote
    /// write has not landed.
    pub fn before_unload(&mut self) -> UnloadDecision {
        if self.identity.is_none() || self.phase == Phase::Uninitialized {
            return UnloadDecision::clean();
        }
        if !self.unsaved && self.desired.is_none() {
            return UnloadDecision::clean();
        }

        self.local.save_backup(&self.state, false);
        self.local.save_pending_changes(&self.state);
        warn!("Leaving with changes that are only saved locally");
        self.events.emit(SyncEvent::LocalFlushed);
        UnloadDecision::unsaved()
    }
}
