//! Error types surfaced to bridge callers.

use std::time::Duration;

use crate::supervisor::SpawnError;

/// Everything that can settle an `invoke` unsuccessfully.
///
/// Protocol-level problems (malformed lines, unmatched ids, unknown topics)
/// never show up here; they are logged and dropped inside the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No worker is live; nothing was written.
    #[error("worker unavailable")]
    WorkerUnavailable,

    #[error("failed to write command to worker: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("worker executable not found (searched: {0})")]
    WorkerNotFound(String),

    #[error("invalid command params: {0}")]
    InvalidParams(String),

    /// The worker answered with `success: false`. Message is the worker's own.
    #[error("{0}")]
    Worker(String),

    /// The worker exited while the command was pending.
    #[error("worker exited: {0}")]
    WorkerExited(String),

    /// The bridge was shut down while the command was pending.
    #[error("bridge shutting down")]
    ShuttingDown,

    #[error("worker handshake failed: {0}")]
    Handshake(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// True for rejections caused by the worker going away rather than by the
    /// command itself.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::WorkerExited(_) | Self::ShuttingDown)
    }

    /// True when the command never reached the worker.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WorkerUnavailable
                | Self::Write(_)
                | Self::Spawn(_)
                | Self::WorkerNotFound(_)
                | Self::InvalidParams(_)
        )
    }
}
