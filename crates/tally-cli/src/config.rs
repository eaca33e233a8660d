//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tally_core::SyncConfig;

/// Client configuration, stored as `config.json` in the data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// WebSocket URL of the tally-store server (offline-only if unset)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Signed-in user (anonymous if unset)
    #[serde(default)]
    pub user_id: Option<String>,

    /// Quiet period before a local change is written remotely
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Window after subscribing in which remote pushes are ignored
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// Seconds to wait for a store response
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Largest local slot value in bytes (unlimited if unset)
    #[serde(default)]
    pub quota_bytes: Option<usize>,
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_warmup_ms() -> u64 {
    1_000
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            user_id: None,
            debounce_ms: default_debounce_ms(),
            warmup_ms: default_warmup_ms(),
            timeout_secs: default_timeout_secs(),
            quota_bytes: None,
        }
    }
}

impl Config {
    /// Load configuration from the data directory, writing defaults if absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::debug!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::debug!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            warmup: Duration::from_millis(self.warmup_ms),
            ..SyncConfig::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("tally");

        let config = Config::load(&data_dir).unwrap();

        assert_eq!(config, Config::default());
        assert!(data_dir.join("config.json").exists());
        // Reloading reads the file just written
        assert_eq!(Config::load(&data_dir).unwrap(), config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("config.json"),
            r#"{ "remoteUrl": "ws://127.0.0.1:9470", "debounceMs": 50 }"#,
        )
        .unwrap();

        let config = Config::load(temp_dir.path()).unwrap();

        assert_eq!(config.remote_url.as_deref(), Some("ws://127.0.0.1:9470"));
        assert_eq!(config.user_id, None);
        let sync = config.sync_config();
        assert_eq!(sync.debounce, Duration::from_millis(50));
        assert_eq!(sync.warmup, Duration::from_secs(1));
        assert_eq!(config.quota_bytes, None);
    }

    #[test]
    fn test_quota_bytes_read_from_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("config.json"),
            r#"{ "quotaBytes": 4096 }"#,
        )
        .unwrap();

        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.quota_bytes, Some(4096));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("config.json"), "{ nope").unwrap();

        let err = Config::load(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config.json"));
    }
}
