//! JSON import and export of the whole state.
//!
//! Import is the one user-facing failure path, so its errors carry enough
//! context to show directly.

use thiserror::Error;

use crate::model::ApplicationState;
use crate::schema::{self, SchemaError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("File is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("File was written by a newer version (schema {0})")]
    UnsupportedVersion(u64),

    #[error("File does not contain budget data: {0}")]
    InvalidData(String),
}

impl From<SchemaError> for ImportError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnsupportedVersion(v) => ImportError::UnsupportedVersion(v),
            other => ImportError::InvalidData(other.to_string()),
        }
    }
}

/// Parse an exported file into a current-schema state.
pub fn import_json(text: &str) -> Result<ApplicationState, ImportError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ImportError::InvalidJson)?;
    Ok(schema::upgrade(value)?)
}

/// Pretty JSON of the whole state.
pub fn export_json(state: &ApplicationState) -> String {
    serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".to_string())
}
