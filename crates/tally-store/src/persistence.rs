//! Snapshot persistence for stored documents.
//!
//! The whole table is written as one JSON file after every accepted write
//! and reloaded on start. Writes go to a sibling temp file first and are
//! renamed into place so a crash never leaves a truncated snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tally_core::{DocumentTable, UserId};

/// One persisted document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    pub user_id: UserId,
    /// Unix timestamp ms of the last accepted write
    pub updated_at: i64,
    pub state: Value,
}

/// On-disk snapshot layout.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub documents: Vec<PersistedDocument>,
}

impl Snapshot {
    pub fn from_table(table: &DocumentTable<Value>) -> Self {
        let mut documents: Vec<_> = table
            .iter()
            .map(|(user_id, doc)| PersistedDocument {
                user_id: user_id.clone(),
                updated_at: doc.updated_at,
                state: doc.payload.clone(),
            })
            .collect();
        // Stable file contents across runs
        documents.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
        Self { documents }
    }

    pub fn into_table(self) -> DocumentTable<Value> {
        let mut table = DocumentTable::new();
        for doc in self.documents {
            table.overwrite(&doc.user_id, doc.state, doc.updated_at);
        }
        table
    }
}

/// Snapshot file at a fixed path.
pub struct SnapshotStorage {
    path: PathBuf,
}

impl SnapshotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table, or an empty one if no snapshot exists yet.
    pub fn load(&self) -> Result<DocumentTable<Value>> {
        if !self.path.exists() {
            return Ok(DocumentTable::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot {}", self.path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid snapshot {}", self.path.display()))?;
        Ok(snapshot.into_table())
    }

    pub fn save(&self, table: &DocumentTable<Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&Snapshot::from_table(table))?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
