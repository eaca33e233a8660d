//! Starting and stopping a sync session for one CLI invocation.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    RemoteStore, SyncHandle, SyncService, SystemClock, UnloadDecision, UserId,
};
use tracing::{debug, warn};

use crate::config::Config;
use crate::file_store::FileStore;
use crate::ws_remote::WsRemote;

/// Local slots live under `<data_dir>/store`.
pub fn local_store(config: &Config, data_dir: &Path) -> FileStore {
    let store = FileStore::new(data_dir.join("store"));
    match config.quota_bytes {
        Some(quota) => store.with_quota(quota),
        None => store,
    }
}

pub fn start(config: &Config, data_dir: &Path) -> Result<SyncHandle> {
    let store = local_store(config, data_dir);

    let identity = config
        .user_id
        .as_deref()
        .map(UserId::new)
        .transpose()
        .context("Invalid user id")?;

    let remote = config.remote_url.as_ref().map(|url| {
        debug!("Using remote store at {}", url);
        let remote: Arc<dyn RemoteStore> =
            Arc::new(WsRemote::new(url.clone()).with_timeout(config.timeout()));
        remote
    });

    Ok(SyncService::spawn(
        config.sync_config(),
        store,
        Arc::new(SystemClock),
        remote,
        identity,
    ))
}

/// Let queued writes finish, then stop the service.
///
/// Waits at most `limit`, or until Ctrl+C. The returned decision says
/// whether changes were left unconfirmed (they stay in the local slots and
/// are recovered on the next start).
pub async fn finish(handle: &SyncHandle, limit: Duration) -> Result<UnloadDecision> {
    tokio::select! {
        idle = tokio::time::timeout(limit, handle.wait_idle()) => {
            if idle.is_err() {
                warn!("Sync did not finish within {:?}", limit);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted while waiting for sync");
        }
    }

    Ok(handle.shutdown().await?)
}
