//! Async host for the sync engine.
//!
//! One tokio task owns the `SyncEngine` and multiplexes four sources with
//! `tokio::select!`: commands from `SyncHandle`s, the debounce deadline,
//! completions of spawned remote writes, and the live remote subscription.
//! Nothing else touches engine state, so the guards in the engine never see
//! interleaved mutation.

use std::future::pending;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::engine::{Phase, SyncEngine, SyncStatus};
use crate::events::EventBus;
use crate::guards::UnloadDecision;
use crate::model::{ApplicationState, UserId};
use crate::reducer::Action;
use crate::remote::{RemoteChange, RemoteError, RemoteStore, RemoteSubscription, SaveOutcome};
use crate::store::KeyValueStore;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Sync service has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

enum Command {
    Dispatch(Action, oneshot::Sender<()>),
    Import(ApplicationState, oneshot::Sender<()>),
    SetIdentity(Option<UserId>, oneshot::Sender<()>),
    BeforeUnload(oneshot::Sender<UnloadDecision>),
    Shutdown(oneshot::Sender<UnloadDecision>),
}

struct WriteCompletion {
    epoch: u64,
    result: std::result::Result<SaveOutcome, RemoteError>,
}

/// Cloneable handle to a running sync service.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ApplicationState>,
    status: watch::Receiver<SyncStatus>,
    events: Arc<EventBus>,
}

impl SyncHandle {
    /// Apply an action. Returns once the engine has processed it.
    pub async fn dispatch(&self, action: Action) -> Result<()> {
        self.request(|reply| Command::Dispatch(action, reply)).await
    }

    /// Replace the whole state, going through the normal outbound flow.
    pub async fn import_data(&self, state: ApplicationState) -> Result<()> {
        self.request(|reply| Command::Import(state, reply)).await
    }

    /// Switch identity (login/logout). Returns once the new session is loaded.
    pub async fn set_identity(&self, identity: Option<UserId>) -> Result<()> {
        self.request(|reply| Command::SetIdentity(identity, reply)).await
    }

    /// Flush local artifacts if changes are not yet remote.
    pub async fn before_unload(&self) -> Result<UnloadDecision> {
        self.request(Command::BeforeUnload).await
    }

    /// Run the unload guard, tear down, and stop the service.
    pub async fn shutdown(&self) -> Result<UnloadDecision> {
        self.request(Command::Shutdown).await
    }

    pub fn state(&self) -> ApplicationState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ApplicationState> {
        self.state.clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Wait until startup resolution has finished.
    pub async fn wait_ready(&self) -> Result<SyncStatus> {
        self.wait_for_status(|s| s.phase == Phase::Ready).await
    }

    /// Wait until nothing is queued or in flight.
    pub async fn wait_idle(&self) -> Result<SyncStatus> {
        self.wait_for_status(SyncStatus::is_idle).await
    }

    async fn wait_for_status(&self, f: impl FnMut(&SyncStatus) -> bool) -> Result<SyncStatus> {
        let mut status = self.status.clone();
        let current = status.wait_for(f).await.map_err(|_| ServiceError::Stopped)?;
        Ok(current.clone())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

pub struct SyncService<S> {
    engine: SyncEngine<S>,
    remote: Option<Arc<dyn RemoteStore>>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<WriteCompletion>,
    completions_rx: mpsc::UnboundedReceiver<WriteCompletion>,
    subscription: Option<RemoteSubscription>,
    state_tx: watch::Sender<ApplicationState>,
    status_tx: watch::Sender<SyncStatus>,
}

impl<S: KeyValueStore + 'static> SyncService<S> {
    /// Start the service on the current tokio runtime.
    ///
    /// Without a remote the service runs signed-out regardless of `identity`.
    pub fn spawn(
        config: SyncConfig,
        store: S,
        clock: Arc<dyn Clock>,
        remote: Option<Arc<dyn RemoteStore>>,
        identity: Option<UserId>,
    ) -> SyncHandle {
        let events = Arc::new(EventBus::new());
        let engine = SyncEngine::new(config, store, clock, Arc::clone(&events));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(engine.state().clone());
        let (status_tx, status_rx) = watch::channel(engine.status());

        let service = Self {
            engine,
            remote,
            commands: commands_rx,
            completions_tx,
            completions_rx,
            subscription: None,
            state_tx,
            status_tx,
        };
        tokio::spawn(service.run(identity));

        SyncHandle {
            commands: commands_tx,
            state: state_rx,
            status: status_rx,
            events,
        }
    }

    async fn run(mut self, identity: Option<UserId>) {
        self.start_session(identity).await;
        self.publish();

        loop {
            let deadline = self.engine.next_write_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All sync handles dropped");
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    self.fire_due_write();
                }
                Some(done) = self.completions_rx.recv() => {
                    self.on_write_completed(done).await;
                }
                change = next_change(&mut self.subscription) => match change {
                    Some(change) => self.engine.on_remote_change(change, Instant::now()),
                    None => {
                        warn!("Remote subscription ended");
                        self.subscription = None;
                    }
                },
            }
            self.publish();
        }

        self.engine.teardown();
        self.subscription = None;
        self.publish();
        info!("Sync service stopped");
    }

    /// Returns `false` when the service should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Dispatch(action, reply) => {
                self.engine.dispatch(action, Instant::now());
                self.publish();
                let _ = reply.send(());
            }
            Command::Import(state, reply) => {
                info!("Importing data ({} sheets)", state.sheets.len());
                self.engine.import_data(state, Instant::now());
                self.publish();
                let _ = reply.send(());
            }
            Command::SetIdentity(identity, reply) => {
                if identity.as_ref() != self.engine.identity() {
                    self.start_session(identity).await;
                }
                self.publish();
                let _ = reply.send(());
            }
            Command::BeforeUnload(reply) => {
                let decision = self.engine.before_unload();
                let _ = reply.send(decision);
            }
            Command::Shutdown(reply) => {
                let decision = self.engine.before_unload();
                self.engine.teardown();
                self.subscription = None;
                self.publish();
                let _ = reply.send(decision);
                return false;
            }
        }
        true
    }

    async fn start_session(&mut self, identity: Option<UserId>) {
        // dropping the old subscription unsubscribes it
        self.subscription = None;

        let identity = match (identity, &self.remote) {
            (Some(user), None) => {
                warn!("No remote configured, running signed out instead of as {}", user);
                None
            }
            (identity, _) => identity,
        };

        self.engine.begin_session(identity.clone());
        self.publish();

        let (Some(user), Some(remote)) = (identity, self.remote.clone()) else {
            self.engine.load_anonymous();
            return;
        };

        let loaded = remote.load(&user).await;
        if let Some(request) = self.engine.apply_startup(loaded) {
            let result = remote.force_save(&request.user, &request.state).await;
            self.engine
                .on_force_save_result(request.epoch, request.source, result);
        }
        self.subscribe(&remote, &user).await;
    }

    async fn subscribe(&mut self, remote: &Arc<dyn RemoteStore>, user: &UserId) {
        match remote.subscribe(user).await {
            Ok(subscription) => {
                debug!("Subscribed to remote changes for {}", user);
                self.subscription = Some(subscription);
                self.engine.on_subscribed(Instant::now());
            }
            Err(e) => warn!("Live updates unavailable for {}: {}", user, e),
        }
    }

    fn fire_due_write(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let Some(request) = self.engine.take_due_write(Instant::now()) else {
            return;
        };

        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = remote
                .save(&request.user, &request.state, request.timestamp)
                .await;
            let _ = completions.send(WriteCompletion {
                epoch: request.epoch,
                result,
            });
        });
    }

    async fn on_write_completed(&mut self, done: WriteCompletion) {
        let saved = matches!(done.result, Ok(SaveOutcome::Saved(_)));
        let current = done.epoch == self.engine.epoch();
        self.engine
            .on_write_result(done.epoch, done.result, Instant::now());

        // remote is reachable again; retry a subscription that failed earlier
        if saved && current && self.subscription.is_none() {
            if let (Some(user), Some(remote)) =
                (self.engine.identity().cloned(), self.remote.clone())
            {
                self.subscribe(&remote, &user).await;
            }
        }
    }

    fn publish(&self) {
        let state = self.engine.state();
        self.state_tx.send_if_modified(|current| {
            if *current != *state {
                *current = state.clone();
                true
            } else {
                false
            }
        });

        let status = self.engine.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_change(subscription: &mut Option<RemoteSubscription>) -> Option<RemoteChange> {
    match subscription {
        Some(subscription) => subscription.next_change().await,
        None => pending().await,
    }
}
