//! Worker supervisor - manages the worker subprocess lifecycle.
//!
//! Flow:
//! 1. Locate the worker executable
//! 2. Spawn it with piped stdin/stdout/stderr
//! 3. Start the stdout router, stderr forwarder and exit watcher tasks
//! 4. Send the `initialize` handshake, mark READY on success
//! 5. On worker exit: clear the handle, reject every pending command
//!
//! There is no automatic restart; a new `initialize` call spawns a fresh
//! worker with the next generation number.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Level;

use crate::bridge::codec::WireCodec;
use crate::bridge::protocol::{Command as WireCommand, InboundMessage};
use crate::config::{BridgeConfig, WorkerOptions};
use crate::correlator::{CommandSink, Correlator};
use crate::error::BridgeError;
use crate::locate::WorkerLocator;
use crate::multiplexer::NotificationMux;
use crate::state::{WorkerInfo, WorkerState};

/// Command name of the startup handshake.
pub const HANDSHAKE_COMMAND: &str = "initialize";

/// Fully resolved launch: program and its complete argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} not captured")]
    MissingPipe(&'static str),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin, stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Spawns the launch program directly.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

type WorkerWriter = Arc<tokio::sync::Mutex<FramedWrite<ChildStdin, WireCodec>>>;

struct LiveWorker {
    info: WorkerInfo,
    writer: WorkerWriter,
    /// Fires (or drops) to make the exit watcher finish termination. Carries
    /// whether SIGTERM was already delivered.
    terminate_tx: Option<oneshot::Sender<bool>>,
    /// Flips to true once the exit watcher has reaped the process.
    reaped: watch::Receiver<bool>,
}

impl LiveWorker {
    /// Deliver SIGTERM before returning and hand the grace period and hard
    /// kill to the exit watcher, which may never be polled again if the
    /// runtime is stopping.
    fn request_termination(&mut self) {
        let Some(tx) = self.terminate_tx.take() else {
            return;
        };
        let signalled = self.info.pid.is_some_and(send_sigterm);
        let _ = tx.send(signalled);
    }
}

#[derive(Default)]
struct SupervisorInner {
    state: WorkerState,
    live: Option<LiveWorker>,
}

pub struct WorkerSupervisor {
    locator: WorkerLocator,
    spawner: Arc<dyn WorkerSpawner>,
    handshake_timeout: Duration,
    terminate_grace: Duration,
    max_line_bytes: usize,
    correlator: Arc<Correlator>,
    mux: Arc<NotificationMux>,
    inner: StdMutex<SupervisorInner>,
    /// Serializes `initialize` so concurrent callers share one worker.
    init_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(
        config: &BridgeConfig,
        correlator: Arc<Correlator>,
        mux: Arc<NotificationMux>,
    ) -> Arc<Self> {
        let mut locator = WorkerLocator::new()
            .with_explicit(config.worker_path.clone())
            .with_bundle_dirs(config.bundle_dirs.clone());
        if let Some(python) = &config.python {
            locator = locator.with_python(python.clone());
        }

        Arc::new(Self {
            locator,
            spawner: Arc::clone(&config.spawner),
            handshake_timeout: config.handshake_timeout,
            terminate_grace: config.terminate_grace,
            max_line_bytes: config.max_line_bytes,
            correlator,
            mux,
            inner: StdMutex::new(SupervisorInner::default()),
            init_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    // Nothing awaits while holding this lock, so poisoning means a panic in
    // plain field assignment; the state is still coherent.
    fn lock_inner(&self) -> MutexGuard<'_, SupervisorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WorkerState {
        self.lock_inner().state
    }

    pub fn worker_info(&self) -> Option<WorkerInfo> {
        self.lock_inner().live.as_ref().map(|w| w.info.clone())
    }

    /// Spawn the worker and complete the handshake.
    ///
    /// Returns immediately if a worker is already live. On handshake failure
    /// the new worker is terminated before the error is returned.
    pub async fn initialize(self: &Arc<Self>, options: &WorkerOptions) -> Result<(), BridgeError> {
        let _init = self.init_lock.lock().await;

        if self.is_live() {
            tracing::debug!("Worker already running, skipping initialize");
            return Ok(());
        }

        let program = self.locator.locate()?;
        let mut args = program.args.clone();
        args.extend(options.launch_args());
        let launch = WorkerLaunch {
            program: program.program.clone(),
            args,
        };

        tracing::info!(program = %launch.program.display(), debug = options.debug, "Spawning worker");
        let mut child = self.spawner.spawn(&launch)?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = WorkerInfo::new(child.id(), generation, program.executable());
        tracing::info!(pid = ?info.pid, generation, "Worker spawned");

        let writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            stdin,
            WireCodec::new(self.max_line_bytes),
        )));
        let reader = FramedRead::new(stdout, WireCodec::new(self.max_line_bytes));

        tokio::spawn(run_reader(
            reader,
            Arc::clone(&self.correlator),
            Arc::clone(&self.mux),
            generation,
        ));
        tokio::spawn(forward_diagnostics(stderr, generation));

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (reaped_tx, reaped) = watch::channel(false);
        {
            let mut inner = self.lock_inner();
            inner.state = WorkerState::Starting;
            inner.live = Some(LiveWorker {
                info,
                writer,
                terminate_tx: Some(terminate_tx),
                reaped,
            });
        }

        tokio::spawn(watch_exit(
            child,
            terminate_rx,
            reaped_tx,
            Arc::downgrade(self),
            generation,
            self.terminate_grace,
        ));

        let sink: &WorkerSupervisor = self;
        let handshake = tokio::time::timeout(
            self.handshake_timeout,
            self.correlator
                .send(sink, HANDSHAKE_COMMAND, options.handshake_params()),
        )
        .await;

        let failure = match handshake {
            Ok(Ok(_)) => {
                let mut inner = self.lock_inner();
                if inner
                    .live
                    .as_ref()
                    .is_some_and(|w| w.info.generation == generation)
                {
                    inner.state = WorkerState::Ready;
                    tracing::info!(generation, "Worker ready");
                    return Ok(());
                }
                "worker exited after handshake".to_string()
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.handshake_timeout),
        };

        tracing::error!(generation, error = %failure, "Worker handshake failed");
        self.stop_generation(generation, || {
            BridgeError::WorkerExited(format!("handshake failed: {failure}"))
        });
        Err(BridgeError::Handshake(failure))
    }

    /// Terminate the live worker and reject everything pending.
    ///
    /// Synchronous and idempotent. SIGTERM is delivered before this returns;
    /// the grace period, hard kill and reaping happen in the background.
    pub fn shutdown(&self) {
        self.begin_shutdown();
    }

    /// [`shutdown`](Self::shutdown), then wait until the worker has been
    /// reaped (after at most `terminate_grace` plus the hard kill).
    ///
    /// Returns immediately when no worker is live.
    pub async fn shutdown_and_wait(&self) {
        let Some(mut reaped) = self.begin_shutdown() else {
            return;
        };
        // Err means the watcher is gone, which only happens after reaping or
        // with the runtime shutting down.
        let _ = reaped.wait_for(|done| *done).await;
    }

    fn begin_shutdown(&self) -> Option<watch::Receiver<bool>> {
        let mut live = {
            let mut inner = self.lock_inner();
            inner.state = WorkerState::NotInitialized;
            inner.live.take()
        }?;

        tracing::info!(pid = ?live.info.pid, generation = live.info.generation, "Shutting down worker");
        live.request_termination();
        let rejected = self.correlator.reject_all(|| BridgeError::ShuttingDown);
        if rejected > 0 {
            tracing::info!(rejected, "Rejected pending commands on shutdown");
        }
        Some(live.reaped.clone())
    }

    fn stop_generation(&self, generation: u64, reason: impl Fn() -> BridgeError) {
        let live = {
            let mut inner = self.lock_inner();
            match &inner.live {
                Some(w) if w.info.generation == generation => {
                    inner.state = WorkerState::NotInitialized;
                    inner.live.take()
                }
                _ => None,
            }
        };
        if let Some(mut live) = live {
            live.request_termination();
            self.correlator.reject_all(reason);
        }
    }

    /// Called by the exit watcher once the process is gone.
    fn handle_exit(&self, generation: u64, reason: String) {
        let was_current = {
            let mut inner = self.lock_inner();
            match &inner.live {
                Some(w) if w.info.generation == generation => {
                    inner.live = None;
                    inner.state = WorkerState::NotInitialized;
                    true
                }
                _ => false,
            }
        };

        if !was_current {
            tracing::debug!(generation, "Ignoring exit of replaced or stopped worker");
            return;
        }

        let rejected = self
            .correlator
            .reject_all(|| BridgeError::WorkerExited(reason.clone()));
        tracing::warn!(generation, rejected, %reason, "Worker exited");
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if let Some(mut live) = self.lock_inner().live.take() {
            live.request_termination();
        }
    }
}

#[async_trait]
impl CommandSink for WorkerSupervisor {
    fn is_live(&self) -> bool {
        self.lock_inner().state.is_live()
    }

    async fn write_command(&self, command: WireCommand) -> Result<(), BridgeError> {
        let writer = self
            .lock_inner()
            .live
            .as_ref()
            .map(|w| Arc::clone(&w.writer))
            .ok_or(BridgeError::WorkerUnavailable)?;

        let mut writer = writer.lock().await;
        writer.send(command).await.map_err(BridgeError::Write)
    }
}

/// Route every decoded stdout message until the stream ends.
///
/// Runs in strict arrival order, so notifications on a topic reach listeners
/// in the order the worker emitted them.
pub(crate) async fn run_reader<R>(
    mut reader: FramedRead<R, WireCodec>,
    correlator: Arc<Correlator>,
    mux: Arc<NotificationMux>,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(InboundMessage::Response(response))) => {
                correlator.resolve(response);
            }
            Some(Ok(InboundMessage::Notification(notification))) => {
                tracing::trace!(topic = %notification.topic, "Notification received");
                mux.dispatch(&notification);
            }
            Some(Err(e)) => {
                tracing::error!(generation, error = %e, "Worker stdout read error");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(generation, "Worker stdout closed");
}

/// Infer a log level from the worker's `time - name - LEVEL - message` lines.
fn worker_log_level(line: &str) -> Level {
    for field in line.split(" - ") {
        match field.trim() {
            "CRITICAL" | "ERROR" => return Level::ERROR,
            "WARNING" | "WARN" => return Level::WARN,
            "INFO" => return Level::INFO,
            "DEBUG" => return Level::DEBUG,
            _ => {}
        }
    }
    Level::INFO
}

/// Surface the worker's stderr through tracing. Diagnostic only.
async fn forward_diagnostics(stderr: ChildStderr, generation: u64) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let level = worker_log_level(line);
                if level == Level::ERROR {
                    tracing::error!(target: "ocularum::worker", generation, "{}", line);
                } else if level == Level::WARN {
                    tracing::warn!(target: "ocularum::worker", generation, "{}", line);
                } else if level == Level::DEBUG {
                    tracing::debug!(target: "ocularum::worker", generation, "{}", line);
                } else {
                    tracing::info!(target: "ocularum::worker", generation, "{}", line);
                }
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "Worker stderr read error");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

/// SIGTERM (unless already `signalled`), wait up to `grace`, then kill.
/// Always reaps.
async fn terminate(child: &mut Child, grace: Duration, signalled: bool) -> io::Result<ExitStatus> {
    let signalled = signalled || child.id().is_some_and(send_sigterm);
    if signalled {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => tracing::warn!(pid = ?child.id(), ?grace, "Worker ignored SIGTERM, killing"),
        }
    }

    child.kill().await?;
    child.wait().await
}

async fn watch_exit(
    mut child: Child,
    terminate_rx: oneshot::Receiver<bool>,
    reaped_tx: watch::Sender<bool>,
    supervisor: Weak<WorkerSupervisor>,
    generation: u64,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        signalled = terminate_rx => terminate(&mut child, grace, signalled.unwrap_or(false)).await,
    };
    reaped_tx.send_replace(true);

    let reason = match status {
        Ok(status) => {
            tracing::info!(generation, %status, "Worker process exited");
            status.to_string()
        }
        Err(e) => {
            tracing::error!(generation, error = %e, "Failed to wait for worker");
            format!("wait failed: {e}")
        }
    };

    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.handle_exit(generation, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;

    use crate::bridge::protocol::Response;

    #[test]
    fn log_level_from_python_format() {
        assert_eq!(
            worker_log_level("2026-01-01 10:00:00,123 - __main__ - ERROR - Failed to initialize Twitch API"),
            Level::ERROR
        );
        assert_eq!(
            worker_log_level("2026-01-01 10:00:00,123 - autotune - WARNING - rate limited"),
            Level::WARN
        );
        assert_eq!(worker_log_level("x - y - DEBUG - z"), Level::DEBUG);
        assert_eq!(worker_log_level("Traceback (most recent call last):"), Level::INFO);
    }

    #[tokio::test]
    async fn reader_routes_split_responses_and_notifications() {
        let correlator = Arc::new(Correlator::new());
        let mux = NotificationMux::new();
        let (mut worker_out, host_in) = tokio::io::duplex(64);

        let seen = Arc::new(StdMutex::new(Vec::<Value>::new()));
        {
            let seen = Arc::clone(&seen);
            mux.subscribe("streamer_live", move |data: &Value| {
                seen.lock().unwrap().push(data.clone());
                Ok(())
            });
        }

        let reader_task = tokio::spawn(run_reader(
            FramedRead::new(host_in, WireCodec::default()),
            Arc::clone(&correlator),
            Arc::clone(&mux),
            1,
        ));

        worker_out
            .write_all(b"{\"notification\":{\"type\":\"streamer_live\",\"data\":1}}\nnot json\n{\"id\":\"nobody\",")
            .await
            .unwrap();
        worker_out
            .write_all(b"\"success\":true}\n{\"notification\":{\"type\":\"streamer_live\",\"data\":2}}\n")
            .await
            .unwrap();
        drop(worker_out);

        reader_task.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(correlator.pending_count(), 0);
    }

    struct CapturingSink(tokio::sync::mpsc::UnboundedSender<WireCommand>);

    #[async_trait]
    impl CommandSink for CapturingSink {
        fn is_live(&self) -> bool {
            true
        }

        async fn write_command(&self, command: WireCommand) -> Result<(), BridgeError> {
            let _ = self.0.send(command);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reader_resolves_pending_command_and_ignores_stray_ids() {
        let correlator = Arc::new(Correlator::new());
        let mux = NotificationMux::new();
        let (mut worker_out, host_in) = tokio::io::duplex(256);
        let (tx, mut written) = tokio::sync::mpsc::unbounded_channel();

        let invoke = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send(&CapturingSink(tx), "get_user_info", json!({"username": "alice"}))
                    .await
            })
        };
        let command = written.recv().await.unwrap();
        assert_eq!(command.command_type, "get_user_info");

        let reader_task = tokio::spawn(run_reader(
            FramedRead::new(host_in, WireCodec::default()),
            Arc::clone(&correlator),
            mux,
            1,
        ));

        for response in [
            Response::success("stray", Value::Null),
            Response::success(command.id.clone(), json!({"login": "alice"})),
        ] {
            let mut line = serde_json::to_vec(&response).unwrap();
            line.push(b'\n');
            worker_out.write_all(&line).await.unwrap();
        }
        drop(worker_out);
        reader_task.await.unwrap();

        assert_eq!(invoke.await.unwrap().unwrap(), json!({"login": "alice"}));
        assert_eq!(correlator.pending_count(), 0);
    }
}
