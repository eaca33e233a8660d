//! Lifecycle guards around the sync engine.

use std::time::Duration;
use tokio::time::Instant;

/// Suppresses remote pushes for a short window after subscribing.
///
/// The first pushes after subscribing are usually the current document or
/// the echo of the first post-load write; both would race startup.
#[derive(Debug, Clone, Default)]
pub struct WarmupGate {
    open_at: Option<Instant>,
}

impl WarmupGate {
    /// Start the window at `now`.
    pub fn arm(&mut self, now: Instant, warmup: Duration) {
        self.open_at = Some(now + warmup);
    }

    /// Closed again until the next subscription.
    pub fn reset(&mut self) {
        self.open_at = None;
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.open_at.is_some_and(|at| now >= at)
    }
}

/// Outcome of the unload guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnloadDecision {
    /// Local artifacts were flushed because the remote write has not landed.
    pub flushed: bool,
    /// The user should be asked to confirm leaving.
    pub prompt: bool,
}

impl UnloadDecision {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn unsaved() -> Self {
        Self {
            flushed: true,
            prompt: true,
        }
    }
}
