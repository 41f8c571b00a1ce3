//! Command correlator - pairs outbound commands with their responses.
//!
//! Every command gets a fresh [`CommandId`] and a pending entry holding the
//! sender half of a oneshot. The worker's response, a lifecycle event
//! (exit/shutdown) or the optional timeout settles it exactly once; whoever
//! removes the entry from the table owns the settlement.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{Command, CommandId, Response};
use crate::error::BridgeError;

pub type CommandResult = Result<Value, BridgeError>;

/// Destination for serialized commands.
///
/// Implemented by the worker supervisor; tests substitute an in-memory sink.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Whether a worker is currently live to receive commands.
    fn is_live(&self) -> bool;

    /// Write one complete command frame.
    async fn write_command(&self, command: Command) -> Result<(), BridgeError>;
}

/// Removes the pending entry when the caller stops waiting (settled, timed
/// out, or the invoke future was dropped).
struct PendingGuard<'a> {
    pending: &'a DashMap<CommandId, oneshot::Sender<CommandResult>>,
    id: CommandId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Pending-command table plus settlement logic.
pub struct Correlator {
    pending: DashMap<CommandId, oneshot::Sender<CommandResult>>,
    command_timeout: Option<Duration>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            command_timeout: None,
        }
    }

    /// Reject commands still unanswered after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn is_pending(&self, id: &CommandId) -> bool {
        self.pending.contains_key(id)
    }

    fn register(&self) -> (CommandId, oneshot::Receiver<CommandResult>) {
        loop {
            let id = CommandId::new();
            if let Entry::Vacant(slot) = self.pending.entry(id.clone()) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Send a command and wait for its settlement.
    ///
    /// Fails with [`BridgeError::WorkerUnavailable`] before touching the
    /// pending table when `sink` has no live worker.
    pub async fn send<S>(&self, sink: &S, command_type: &str, params: Value) -> CommandResult
    where
        S: CommandSink + ?Sized,
    {
        if !sink.is_live() {
            return Err(BridgeError::WorkerUnavailable);
        }

        let (id, mut rx) = self.register();
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        tracing::debug!(command_id = %id, command_type, "Sending command");
        let command = Command {
            id: id.clone(),
            command_type: command_type.to_string(),
            params,
        };

        if let Err(e) = sink.write_command(command).await {
            tracing::warn!(command_id = %id, command_type, error = %e, "Failed to write command");
            self.pending.remove(&id);
            return Err(e);
        }

        // The worker may have gone away after the liveness check but before its
        // exit swept the table; nobody would ever settle this entry.
        if !sink.is_live() && self.pending.remove(&id).is_some() {
            return Err(BridgeError::WorkerUnavailable);
        }

        let settled = match self.command_timeout {
            None => (&mut rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    if self.pending.remove(&id).is_some() {
                        tracing::warn!(command_id = %id, command_type, ?limit, "Command timed out");
                        return Err(BridgeError::Timeout(limit));
                    }
                    // Settled concurrently with the deadline; take that result.
                    rx.await
                }
            },
        };

        settled.unwrap_or(Err(BridgeError::ShuttingDown))
    }

    /// Settle the pending entry matching `response`.
    ///
    /// Returns false (and does nothing else) for late, duplicate or spurious ids.
    pub fn resolve(&self, response: Response) -> bool {
        let Some((id, tx)) = self.pending.remove(&response.id) else {
            tracing::debug!(
                command_id = %response.id,
                "Discarding response with no pending command"
            );
            return false;
        };

        let result = response.into_result().map_err(BridgeError::Worker);
        match &result {
            Ok(_) => tracing::debug!(command_id = %id, "Command succeeded"),
            Err(e) => tracing::debug!(command_id = %id, error = %e, "Command failed"),
        }
        if tx.send(result).is_err() {
            tracing::debug!(command_id = %id, "Caller stopped waiting before response");
        }
        true
    }

    /// Reject every pending entry; returns how many were rejected.
    pub fn reject_all(&self, reason: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<CommandId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(reason()));
                rejected += 1;
            }
        }
        rejected
    }
}
