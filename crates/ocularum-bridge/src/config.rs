//! Bridge configuration.
//!
//! Built with `with_*` methods; [`BridgeConfig::from_env`] seeds it from
//! `OCULARUM_*` environment variables so hosts only override what they need.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::bridge::framer::DEFAULT_MAX_LINE_BYTES;
use crate::supervisor::{ProcessSpawner, WorkerSpawner};

pub const ENV_WORKER: &str = "OCULARUM_WORKER";
pub const ENV_CLIENT_ID: &str = "OCULARUM_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "OCULARUM_CLIENT_SECRET";
pub const ENV_DEBUG: &str = "OCULARUM_DEBUG";
pub const ENV_HANDSHAKE_TIMEOUT: &str = "OCULARUM_HANDSHAKE_TIMEOUT_SECS";
pub const ENV_COMMAND_TIMEOUT: &str = "OCULARUM_COMMAND_TIMEOUT_SECS";
pub const ENV_PYTHON: &str = "OCULARUM_PYTHON";

/// Startup parameters handed to the worker.
///
/// Credentials go both on the command line and into the `initialize`
/// handshake, matching what the worker reads.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub debug: bool,
}

impl WorkerOptions {
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(id) = &self.client_id {
            args.push("--client-id".to_string());
            args.push(id.clone());
        }
        if let Some(secret) = &self.client_secret {
            args.push("--client-secret".to_string());
            args.push(secret.clone());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }

    pub fn handshake_params(&self) -> Value {
        json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        })
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("debug", &self.debug)
            .finish()
    }
}

pub struct BridgeConfig {
    pub worker: WorkerOptions,
    /// Explicit worker executable or script; skips discovery when set.
    pub worker_path: Option<PathBuf>,
    /// Extra directories searched for a bundled worker before the defaults.
    pub bundle_dirs: Vec<PathBuf>,
    /// Interpreter for `.py` workers. `None` uses `python3` (`python` on Windows).
    pub python: Option<String>,
    pub handshake_timeout: Duration,
    /// Per-command deadline. `None` leaves commands pending until the worker
    /// answers, exits, or the bridge shuts down.
    pub command_timeout: Option<Duration>,
    /// How long the worker gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,
    pub max_line_bytes: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            worker_path: None,
            bundle_dirs: Vec::new(),
            python: None,
            handshake_timeout: Duration::from_secs(30),
            command_timeout: None,
            terminate_grace: Duration::from_secs(3),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            spawner: Arc::new(ProcessSpawner),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = env_string(key)?;
    match raw.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring invalid duration");
            None
        }
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        env_string(key).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `OCULARUM_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.worker_path = env_string(ENV_WORKER).map(PathBuf::from);
        config.python = env_string(ENV_PYTHON);
        config.worker.client_id = env_string(ENV_CLIENT_ID);
        config.worker.client_secret = env_string(ENV_CLIENT_SECRET);
        config.worker.debug = env_flag(ENV_DEBUG);
        if let Some(timeout) = env_secs(ENV_HANDSHAKE_TIMEOUT) {
            config.handshake_timeout = timeout;
        }
        config.command_timeout = env_secs(ENV_COMMAND_TIMEOUT);
        config
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.worker.client_id = Some(client_id.into());
        self.worker.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.worker.debug = debug;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_dirs.push(dir.into());
        self
    }

    pub fn with_python_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.python = Some(interpreter.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("worker", &self.worker)
            .field("worker_path", &self.worker_path)
            .field("bundle_dirs", &self.bundle_dirs)
            .field("python", &self.python)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("terminate_grace", &self.terminate_grace)
            .field("max_line_bytes", &self.max_line_bytes)
            .finish_non_exhaustive()
    }
}
