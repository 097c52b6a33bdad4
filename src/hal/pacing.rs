//! Hardware-ready pacing signal.

use std::time::Duration;

/// Outcome of waiting on the pacing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// The hardware can accept the next frame.
    Ready,
    TimedOut,
    /// The source is shut down; no further signals will arrive.
    Stopped,
}

/// Source of the per-frame "ready" signal that drives the reconciliation loop.
#[cfg_attr(test, mockall::automock)]
pub trait PacingSource: Send + Sync {
    fn wait(&self, timeout: Duration) -> Pacing;
}
