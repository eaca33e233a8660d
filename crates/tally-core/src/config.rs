use std::time::Duration;

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last local mutation before a remote write fires
    pub debounce: Duration,
    /// Remote pushes are ignored for this long after subscribing
    pub warmup: Duration,
    /// A push must be newer than the cursor by more than this to be accepted
    pub echo_margin_ms: i64,
    /// Prefix for local slot keys (`<prefix>:data`, `:backup`, `:pending`)
    pub key_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            warmup: Duration::from_secs(1),
            echo_margin_ms: 500,
            key_prefix: "tally".to_string(),
        }
    }
}
