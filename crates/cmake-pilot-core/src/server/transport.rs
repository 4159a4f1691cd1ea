//! Subprocess + local endpoint transport for the CMake server
//!
//! The server creates its pipe asynchronously after start, so the
//! supervisor task polls the endpoint until it accepts a connection or the
//! process goes away. Decoded frames and lifecycle changes are reported on
//! an event channel tagged with the session generation.

use super::codec::{FrameCodec, FrameError};
use super::traits::{ServerLauncher, ServerLink};
use crate::error::{Error, ProtocolError, Result, StartupError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Delay between endpoint connection attempts
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Number of stderr lines kept for exit reports
pub const STDERR_TAIL_LINES: usize = 20;

/// How long frames already written by an exited server are still read
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const WRITER_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK_BYTES: usize = 8192;

/// How to launch the server process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub endpoint: PathBuf,
}

impl LaunchSpec {
    /// `cmake -E server --experimental --pipe=<endpoint>`
    pub fn cmake_server(
        cmake: impl Into<PathBuf>,
        endpoint: impl Into<PathBuf>,
        env: HashMap<String, String>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            program: cmake.into(),
            args: vec![
                "-E".to_string(),
                "server".to_string(),
                "--experimental".to_string(),
                format!("--pipe={}", endpoint.display()),
            ],
            env,
            cwd: None,
            endpoint,
        }
    }
}

/// Pick a fresh endpoint path for a session
pub fn endpoint_path(tag: &str) -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\cmake-pilot-{}", tag))
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir().join(format!("cmake-pilot-{}.sock", tag))
    }
}

/// Lifecycle of the server process.
///
/// `stop()` moves `Running` to `StoppingIntentionally` before the kill is
/// issued; the exit watcher reads the flag to tell a requested stop from a
/// crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLifecycle {
    Running { pid: Option<u32> },
    StoppingIntentionally,
    Stopped,
}

/// How an observed process exit should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Unexpected,
    Intentional,
}

/// Shared lifecycle flag between the transport handle and its supervisor
#[derive(Debug, Clone)]
pub struct LifecycleFlag(Arc<Mutex<ProcessLifecycle>>);

impl LifecycleFlag {
    pub fn running(pid: Option<u32>) -> Self {
        Self(Arc::new(Mutex::new(ProcessLifecycle::Running { pid })))
    }

    pub fn get(&self) -> ProcessLifecycle {
        *self.0.lock()
    }

    /// Returns true when this call initiated the stop
    pub fn begin_stop(&self) -> bool {
        let mut state = self.0.lock();
        match *state {
            ProcessLifecycle::Running { .. } => {
                *state = ProcessLifecycle::StoppingIntentionally;
                true
            }
            _ => false,
        }
    }

    pub fn observe_exit(&self) -> ExitKind {
        let mut state = self.0.lock();
        let kind = match *state {
            ProcessLifecycle::Running { .. } => ExitKind::Unexpected,
            ProcessLifecycle::StoppingIntentionally | ProcessLifecycle::Stopped => {
                ExitKind::Intentional
            }
        };
        *state = ProcessLifecycle::Stopped;
        kind
    }
}

/// What happened to the server, as seen by the transport
#[derive(Debug)]
pub enum TransportEventKind {
    Connected,
    Frame(serde_json::Value),
    Malformed(FrameError),
    Exited(ExitReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub kind: ExitKind,
    /// The endpoint never became available
    pub before_ready: bool,
    pub status: Option<i32>,
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        let status = self
            .status
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        if self.stderr_tail.is_empty() {
            status
        } else {
            format!("{}: {}", status, self.stderr_tail.join("\n"))
        }
    }
}

#[derive(Debug)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Endpoint for T {}

#[cfg(unix)]
async fn connect_endpoint(path: &Path) -> std::io::Result<Box<dyn Endpoint>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn connect_endpoint(path: &Path) -> std::io::Result<Box<dyn Endpoint>> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(pipe))
}

/// Owns one server subprocess and its endpoint connection
pub struct Transport {
    lifecycle: LifecycleFlag,
    writer_tx: mpsc::Sender<Vec<u8>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    _supervisor: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Spawn the server and start polling its endpoint.
    ///
    /// Fails only when the process cannot be spawned; endpoint readiness is
    /// reported later as [`TransportEventKind::Connected`].
    pub async fn start(
        spec: LaunchSpec,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self> {
        debug!(
            "Spawning server: {} {:?} (cwd: {:?})",
            spec.program.display(),
            spec.args,
            spec.cwd
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Startup(StartupError::SpawnFailed {
                command: spec.program.display().to_string(),
                reason: e.to_string(),
            })
        })?;

        let pid = child.id();
        info!("CMake server started (pid {:?})", pid);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(Self::read_stderr_task(stderr, Arc::clone(&stderr_tail))));

        let lifecycle = LifecycleFlag::running(pid);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();

        let supervisor = tokio::spawn(
            Supervisor {
                generation,
                endpoint: spec.endpoint,
                lifecycle: lifecycle.clone(),
                events,
                stderr_tail,
                stderr_task,
            }
            .run(child, writer_rx, kill_rx),
        );

        Ok(Self {
            lifecycle,
            writer_tx,
            kill_tx: Mutex::new(Some(kill_tx)),
            _supervisor: supervisor,
        })
    }

    pub fn lifecycle(&self) -> ProcessLifecycle {
        self.lifecycle.get()
    }

    /// Queue a complete frame for the endpoint
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| Error::Protocol(ProtocolError::ConnectionClosed))
    }

    /// Terminate the server. Safe to call more than once.
    pub fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            trace!("Stop requested for a server that is not running");
            return;
        }
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Background task to drain stderr, keeping the most recent lines
    async fn read_stderr_task(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Server stderr closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        debug!("Server stderr: {}", trimmed);
                        let mut tail = tail.lock();
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(trimmed.to_string());
                    }
                }
                Err(e) => {
                    error!("Error reading server stderr: {}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl ServerLink for Transport {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        Transport::send(self, frame).await
    }

    fn stop(&self) {
        Transport::stop(self)
    }
}

/// State owned by the supervisor task
struct Supervisor {
    generation: u64,
    endpoint: PathBuf,
    lifecycle: LifecycleFlag,
    events: mpsc::Sender<TransportEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

enum Outcome {
    Exited(Option<i32>),
    Killed,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        writer_rx: mpsc::Receiver<Vec<u8>>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let endpoint = tokio::select! {
            connected = Self::poll_endpoint(&self.endpoint) => connected,
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                self.report_exit(Outcome::Exited(code), true).await;
                return;
            }
            _ = &mut kill_rx => {
                Self::kill(&mut child).await;
                self.report_exit(Outcome::Killed, true).await;
                return;
            }
        };

        info!("Connected to CMake server endpoint {}", self.endpoint.display());
        self.emit(TransportEventKind::Connected).await;

        let (reader, writer) = tokio::io::split(endpoint);
        let writer_task = tokio::spawn(Self::write_task(writer, writer_rx));
        let mut reader_task = tokio::spawn(Self::read_frames(
            reader,
            self.generation,
            self.events.clone(),
        ));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status.ok().and_then(|s| s.code())),
            _ = &mut kill_rx => {
                Self::kill(&mut child).await;
                Outcome::Killed
            }
        };

        // Frames written just before exit are still buffered in the endpoint
        // and must be delivered ahead of the exit report.
        match outcome {
            Outcome::Exited(_) => {
                if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader_task)
                    .await
                    .is_err()
                {
                    debug!("Endpoint still open {:?} after server exit", DRAIN_TIMEOUT);
                    reader_task.abort();
                }
            }
            Outcome::Killed => reader_task.abort(),
        }

        writer_task.abort();
        self.report_exit(outcome, false).await;
    }

    async fn poll_endpoint(path: &Path) -> Box<dyn Endpoint> {
        let mut attempts = 0u32;
        loop {
            match connect_endpoint(path).await {
                Ok(endpoint) => {
                    debug!("Endpoint ready after {} attempts", attempts + 1);
                    return endpoint;
                }
                Err(e) => {
                    attempts += 1;
                    trace!("Endpoint not ready (attempt {}): {}", attempts, e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn read_frames(
        mut reader: impl AsyncRead + Unpin,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let mut codec = FrameCodec::new();
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("Server endpoint closed");
                    break;
                }
                Ok(n) => {
                    for decoded in codec.feed(&chunk[..n]) {
                        let kind = match decoded {
                            Ok(value) => TransportEventKind::Frame(value),
                            Err(e) => {
                                warn!("Dropping undecodable frame: {}", e);
                                TransportEventKind::Malformed(e)
                            }
                        };
                        if !send_event(&events, generation, kind).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading server endpoint: {}", e);
                    break;
                }
            }
        }
    }

    async fn write_task(mut writer: impl AsyncWrite + Unpin, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = rx.recv().await {
            trace!("Sending frame ({} bytes)", frame.len());
            if let Err(e) = writer.write_all(&frame).await {
                error!("Failed to write to server endpoint: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush server endpoint: {}", e);
                break;
            }
        }
        debug!("Endpoint writer task ended");
    }

    async fn kill(child: &mut Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill CMake server: {}", e);
        }
    }

    async fn report_exit(&mut self, outcome: Outcome, before_ready: bool) {
        let kind = self.lifecycle.observe_exit();

        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
        }
        let stderr_tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();

        let status = match outcome {
            Outcome::Exited(code) => code,
            Outcome::Killed => None,
        };

        let report = ExitReport {
            kind,
            before_ready,
            status,
            stderr_tail,
        };

        match kind {
            ExitKind::Unexpected => warn!("CMake server exited unexpectedly: {}", report.describe()),
            ExitKind::Intentional => debug!("CMake server stopped"),
        }

        self.emit(TransportEventKind::Exited(report)).await;

        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.endpoint);
        }
    }

    async fn emit(&self, kind: TransportEventKind) -> bool {
        send_event(&self.events, self.generation, kind).await
    }
}

async fn send_event(
    events: &mpsc::Sender<TransportEvent>,
    generation: u64,
    kind: TransportEventKind,
) -> bool {
    if events.send(TransportEvent { generation, kind }).await.is_err() {
        debug!("Transport event receiver dropped");
        return false;
    }
    true
}

/// Launches real `cmake -E server` processes
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: LaunchSpec,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn ServerLink>> {
        let transport = Transport::start(spec, generation, events).await?;
        Ok(Box::new(transport))
    }
}
