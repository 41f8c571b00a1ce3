//! Worker lifecycle state types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No worker process (never started, exited, or shut down)
    #[default]
    NotInitialized,
    /// Spawned, handshake in flight
    Starting,
    /// Handshake succeeded
    Ready,
}

impl WorkerState {
    /// Whether a process is running and accepting commands.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

/// Snapshot of the live worker for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// OS process id, if the platform reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Increments on every spawn; identifies this worker across restarts.
    pub generation: u64,
    /// When the process was spawned (RFC 3339).
    pub started_at: String,
    pub executable: PathBuf,
}

impl WorkerInfo {
    pub fn new(pid: Option<u32>, generation: u64, executable: PathBuf) -> Self {
        Self {
            pid,
            generation,
            started_at: chrono::Utc::now().to_rfc3339(),
            executable,
        }
    }
}
