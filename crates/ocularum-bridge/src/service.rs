//! Bridge service - the surface hosts talk to.
//!
//! Owns the correlator, the notification multiplexer and the worker
//! supervisor. Construct one per worker and share it as `Arc<BridgeService>`.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::multiplexer::{ListenerId, NotificationMux, Subscription};
use crate::state::{WorkerInfo, WorkerState};
use crate::supervisor::WorkerSupervisor;

pub struct BridgeService {
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    mux: Arc<NotificationMux>,
    supervisor: Arc<WorkerSupervisor>,
}

impl BridgeService {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let correlator = Arc::new(Correlator::new().with_timeout(config.command_timeout));
        let mux = NotificationMux::new();
        let supervisor =
            WorkerSupervisor::new(&config, Arc::clone(&correlator), Arc::clone(&mux));

        tracing::debug!(?config, "Bridge service created");
        Arc::new(Self {
            config,
            correlator,
            mux,
            supervisor,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the worker and complete the handshake. No-op if already live.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.supervisor.initialize(&self.config.worker).await
    }

    /// Send a command and wait for its outcome.
    ///
    /// `params` must be a JSON object or `null` (sent as `{}`).
    pub async fn invoke(&self, command_type: &str, params: Value) -> Result<Value, BridgeError> {
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(BridgeError::InvalidParams(format!(
                    "params for '{command_type}' must be an object, got {}",
                    json_kind(&other)
                )));
            }
        };

        tracing::debug!(command = command_type, "Invoking worker command");
        let sink: &WorkerSupervisor = &self.supervisor;
        self.correlator.send(sink, command_type, params).await
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.mux.subscribe(topic, callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.mux.unsubscribe(id)
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.mux.listener_count(topic)
    }

    /// Terminate the worker and reject all pending commands. Idempotent.
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }

    /// Like [`shutdown`](Self::shutdown), but resolves once the worker
    /// process has exited and been reaped.
    pub async fn shutdown_and_wait(&self) {
        self.supervisor.shutdown_and_wait().await;
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    pub fn worker_info(&self) -> Option<WorkerInfo> {
        self.supervisor.worker_info()
    }

    pub fn pending_commands(&self) -> usize {
        self.correlator.pending_count()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn invoke_without_worker_is_unavailable() {
        let service = BridgeService::new(BridgeConfig::new());
        let err = service
            .invoke("start_stream", json!({"channel": "alice"}))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::WorkerUnavailable));
        assert_eq!(service.pending_commands(), 0);
        assert_eq!(service.state(), WorkerState::NotInitialized);
        assert!(service.worker_info().is_none());
    }

    #[tokio::test]
    async fn non_object_params_are_rejected() {
        let service = BridgeService::new(BridgeConfig::new());
        let err = service
            .invoke("get_user_info", json!(["alice"]))
            .await
            .unwrap_err();

        let BridgeError::InvalidParams(message) = err else {
            panic!("expected InvalidParams, got {err:?}");
        };
        assert!(message.contains("get_user_info"));
        assert!(message.contains("array"));
    }

    #[tokio::test]
    async fn null_params_pass_validation() {
        let service = BridgeService::new(BridgeConfig::new());
        // Reaches the liveness check rather than failing validation.
        let err = service
            .invoke("get_active_streams", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::WorkerUnavailable));
    }

    #[test]
    fn subscribe_and_unsubscribe_through_service() {
        let service = BridgeService::new(BridgeConfig::new());
        let sub = service.subscribe("streamer_live", |_: &Value| Ok(()));
        assert_eq!(service.listener_count("streamer_live"), 1);
        assert!(service.unsubscribe(sub.id()));
        assert!(!service.unsubscribe(sub.id()));
        assert_eq!(service.listener_count("streamer_live"), 0);
    }

    #[test]
    fn shutdown_without_worker_is_noop() {
        let service = BridgeService::new(BridgeConfig::new());
        service.shutdown();
        service.shutdown();
        assert_eq!(service.state(), WorkerState::NotInitialized);
    }

    #[tokio::test]
    async fn shutdown_and_wait_without_worker_returns() {
        let service = BridgeService::new(BridgeConfig::new());
        service.shutdown_and_wait().await;
        assert_eq!(service.state(), WorkerState::NotInitialized);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bundled_script_runs_under_configured_interpreter() {
        let bundle = tempfile::tempdir().unwrap();
        std::fs::write(
            bundle.path().join("main.py"),
            r#"IFS= read -r line
id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
printf '{"id":"%s","success":true,"data":null}\n' "$id"
while IFS= read -r line; do :; done
"#,
        )
        .unwrap();

        let service = BridgeService::new(
            BridgeConfig::new()
                .with_bundle_dir(bundle.path())
                .with_python_interpreter("/bin/sh")
                .with_handshake_timeout(std::time::Duration::from_secs(10)),
        );
        service.initialize().await.unwrap();

        assert_eq!(service.state(), WorkerState::Ready);
        let info = service.worker_info().unwrap();
        assert_eq!(info.executable, bundle.path().join("main.py"));
        service.shutdown_and_wait().await;
    }

    #[tokio::test]
    async fn missing_explicit_worker_fails_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            BridgeService::new(BridgeConfig::new().with_worker_path(dir.path().join("missing")));

        let err = service.initialize().await.unwrap_err();
        assert!(matches!(err, BridgeError::WorkerNotFound(_)));
        assert_eq!(service.state(), WorkerState::NotInitialized);
    }
}
