//! ocularum-bridge: process command bridge for the Ocularum worker.
//!
//! Spawns and supervises the worker subprocess, exchanges line-delimited JSON
//! over its stdio, correlates commands with responses and fans notifications
//! out to subscribers. [`BridgeService`] is the only surface callers need.

mod config;
mod error;
mod locate;
mod state;

pub mod bridge;
pub mod correlator;
pub mod multiplexer;
pub mod service;
pub mod supervisor;

pub use bridge::protocol::{Command, CommandId, InboundMessage, Notification, Response};
pub use config::{BridgeConfig, WorkerOptions};
pub use correlator::{CommandResult, CommandSink, Correlator};
pub use error::BridgeError;
pub use locate::{WorkerLocator, WorkerProgram};
pub use multiplexer::{ListenerId, NotificationMux, Subscription};
pub use service::BridgeService;
pub use state::{WorkerInfo, WorkerState};
pub use supervisor::{ProcessSpawner, SpawnError, WorkerLaunch, WorkerSpawner, WorkerSupervisor};
