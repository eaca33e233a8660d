//! Startup resolution: picks the initial state from remote and local artifacts.
//!
//! Precedence while the remote is reachable:
//! 1. unsaved backup newer than the remote document
//! 2. pending change newer than the remote document
//! 3. the remote document
//! 4. anonymous primary snapshot with sheets (migration), else empty
//!
//! Anything that might not have reached the cloud wins over an older remote
//! copy; a remote copy newer than every local artifact wins over all of them.

use crate::events::StartupSource;
use crate::model::ApplicationState;
use crate::remote::RemoteRecord;
use crate::store::{BackupRecord, PendingChangeRecord};

/// Local artifacts read at startup.
#[derive(Debug, Clone, Default)]
pub struct LocalArtifacts {
    pub backup: Option<BackupRecord>,
    pub pending: Option<PendingChangeRecord>,
    pub primary: Option<ApplicationState>,
}

/// What the engine must do after adopting the resolved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Remote is authoritative: set the cursor and drop local artifacts.
    AdoptRemote { timestamp: i64 },
    /// Push the adopted state unconditionally.
    ForceSave,
    /// Nothing to push and nothing to reconcile.
    Fresh,
    /// Remote unreachable. `persist` means the adopted state may not exist
    /// remotely and must be kept as an unsaved backup.
    Offline { persist: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub source: StartupSource,
    pub state: ApplicationState,
    pub followup: Followup,
}

/// Resolve with a successful remote read (`None` means no document).
pub fn resolve(remote: Option<RemoteRecord>, local: LocalArtifacts, now_ms: i64) -> Resolution {
    let remote_ts = remote.as_ref().and_then(|r| r.updated_at).unwrap_or(0);

    if let Some(backup) = local.backup {
        if !backup.saved_to_cloud && backup.timestamp > remote_ts {
            return Resolution {
                source: StartupSource::Backup,
                state: backup.state,
                followup: Followup::ForceSave,
            };
        }
    }

    if let Some(pending) = local.pending {
        if pending.timestamp > remote_ts {
            return Resolution {
                source: StartupSource::Pending,
                state: pending.state,
                followup: Followup::ForceSave,
            };
        }
    }

    if let Some(record) = remote {
        return Resolution {
            source: StartupSource::Remote,
            followup: Followup::AdoptRemote {
                timestamp: record.updated_at.unwrap_or(now_ms),
            },
            state: record.state,
        };
    }

    // An unsaved backup with no remote document always matched the first
    // branch, so only the primary snapshot is left to migrate.
    match local.primary {
        Some(primary) if primary.has_sheets() => Resolution {
            source: StartupSource::Migration,
            state: primary,
            followup: Followup::ForceSave,
        },
        _ => Resolution {
            source: StartupSource::Empty,
            state: ApplicationState::empty(),
            followup: Followup::Fresh,
        },
    }
}

/// Resolve when the remote could not be read: best local artifact, no push.
///
/// Order: unsaved backup, pending change, saved backup, primary snapshot.
pub fn resolve_offline(local: LocalArtifacts) -> Resolution {
    let offline = |state, persist| Resolution {
        source: StartupSource::Offline,
        state,
        followup: Followup::Offline { persist },
    };

    match (local.backup, local.pending, local.primary) {
        (Some(backup), _, _) if !backup.saved_to_cloud => offline(backup.state, true),
        (_, Some(pending), _) => offline(pending.state, true),
        (Some(backup), None, _) => offline(backup.state, false),
        (None, None, Some(primary)) => {
            let persist = primary.has_sheets();
            offline(primary, persist)
        }
        (None, None, None) => Resolution {
            source: StartupSource::Empty,
            state: ApplicationState::empty(),
            followup: Followup::Offline { persist: false },
        },
    }
}
