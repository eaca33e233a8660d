//! File-backed key-value store: one JSON file per key under a data directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tally_core::{KeyValueStore, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

pub struct FileStore {
    base_path: PathBuf,
    /// Largest value accepted, if limited
    quota_bytes: Option<usize>,
}

impl FileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `tally:backup` is stored as `tally.backup.json`.
    fn full_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '.' })
            .collect();
        self.base_path.join(format!("{name}.json"))
    }
}

fn io_error(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::StorageFull => StoreError::QuotaExceeded,
        _ => StoreError::Io(e.to_string()),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.full_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.quota_bytes.is_some_and(|quota| value.len() > quota) {
            return Err(StoreError::QuotaExceeded);
        }

        fs::create_dir_all(&self.base_path).map_err(io_error)?;

        // Write-then-rename so readers never see a partial value
        let path = self.full_path(key);
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, value).map_err(io_error)?;
        fs::rename(&temp, &path).map_err(io_error)
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}
