use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{Display, EnumString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, FramingError};
use crate::framing::{DEFAULT_MAX_BUFFER_BYTES, LineFramer};
use crate::jsonrpc::{Message, Request};

/// Prefix of the id used for the bridge's own `initialize` request.
pub const HANDSHAKE_ID_PREFIX: &str = "bridge-init-";

const READ_CHUNK: usize = 8192;

/// How long an exited child's stdout may keep delivering before the channel
/// gives up on it. A grandchild holding the pipe open would otherwise stall it.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Receives everything the worker sends. The channel itself keeps no correlation state.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message);

    /// Called exactly once, when the channel transitions to [`WorkerState::Crashed`].
    fn on_worker_exit(&self, reason: &str);
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Crashed,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub handshake_delay: Duration,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub max_buffer_bytes: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(1000),
            protocol_version: "2024-11-05".to_string(),
            client_name: "worker-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Program, arguments and extra environment for a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Short name used in logs: the program's file stem.
    pub fn name(&self) -> String {
        std::path::Path::new(&self.program)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("worker")
            .to_string()
    }
}

struct Shared {
    name: String,
    state: watch::Sender<WorkerState>,
    handler: Arc<dyn InboundHandler>,
}

impl Shared {
    fn mark_crashed(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == WorkerState::Crashed {
                false
            } else {
                *state = WorkerState::Crashed;
                true
            }
        });
        if changed {
            error!(worker = %self.name, %reason, "worker unavailable");
            self.handler.on_worker_exit(reason);
        }
    }

    fn deliver(&self, framed: Result<Message, FramingError>) {
        match framed {
            Ok(message) => {
                debug!(worker = %self.name, id = ?message.id(), "message from worker");
                self.handler.on_message(message);
            }
            Err(e) => warn!(worker = %self.name, error = %e, "dropping upstream message"),
        }
    }
}

/// What [`start`] hands back to the constructors.
struct Started {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<AbortHandle>,
    /// Fires once the reader has delivered everything the worker wrote.
    drained: oneshot::Receiver<()>,
}

struct Inner {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<AbortHandle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Handle to one worker speaking newline-delimited JSON-RPC.
///
/// Cheap to clone. When the last handle is dropped the background tasks stop and a
/// spawned child is killed.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("name", &self.inner.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerChannel {
    /// Launch `command` as a child process and wire JSON-RPC over its stdin/stdout.
    /// Stderr lines are logged.
    pub fn spawn(
        command: &WorkerCommand,
        options: WorkerOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, ChannelError> {
        let mut child = TokioCommand::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ChannelError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ChannelError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ChannelError::MissingPipe("stderr"))?;

        let name = command.name();
        info!(worker = %name, program = %command.program, pid = ?child.id(), "worker spawned");

        let Started {
            shared,
            outbound,
            mut tasks,
            drained,
        } = start(name, stdout, stdin, options, handler);

        let stderr_shared = Arc::clone(&shared);
        tasks.push(
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker = %stderr_shared.name, "{line}");
                }
            })
            .abort_handle(),
        );

        // Not aborted on drop: dropping the kill sender makes this task kill the child.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let wait_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => {
                    // responses written just before exit are still in the pipe
                    if tokio::time::timeout(EXIT_DRAIN_GRACE, drained).await.is_err() {
                        warn!(worker = %wait_shared.name, "worker output still open after exit");
                    }
                    match status {
                        Ok(status) => format!("worker exited with {status}"),
                        Err(e) => format!("failed to wait on worker: {e}"),
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(worker = %wait_shared.name, error = %e, "failed to kill worker");
                    }
                    "worker shut down".to_string()
                }
            };
            wait_shared.mark_crashed(&reason);
        });

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                outbound,
                kill: Mutex::new(Some(kill_tx)),
                tasks,
            }),
        })
    }

    /// Run the channel over an arbitrary async byte pair instead of a child process.
    pub fn from_io<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        options: WorkerOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Started {
            shared,
            outbound,
            tasks,
            ..
        } = start(name.into(), reader, writer, options, handler);
        Self {
            inner: Arc::new(Inner {
                shared,
                outbound,
                kill: Mutex::new(None),
                tasks,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.shared.state.subscribe()
    }

    /// Resolves once the handshake is done, or fails if the worker died first.
    pub async fn wait_until_ready(&self) -> Result<(), ChannelError> {
        let mut rx = self.subscribe_state();
        let state = rx
            .wait_for(|state| *state != WorkerState::Starting)
            .await
            .map(|state| *state)
            .unwrap_or(WorkerState::Crashed);
        match state {
            WorkerState::Ready => Ok(()),
            state => Err(ChannelError::WorkerUnavailable { state }),
        }
    }

    /// Queue one message for the worker. Lines are written by a single task, so two
    /// messages never interleave.
    pub fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let state = self.state();
        if state != WorkerState::Ready {
            return Err(ChannelError::WorkerUnavailable { state });
        }
        let line = serde_json::to_string(message)?;
        self.inner
            .outbound
            .send(line)
            .map_err(|_| ChannelError::WorkerUnavailable {
                state: WorkerState::Crashed,
            })
    }

    /// Kill the worker (spawned mode) and mark the channel crashed.
    pub fn shutdown(&self) {
        info!(worker = %self.name(), "shutting down worker");
        if let Some(kill) = self.inner.kill.lock().ok().and_then(|mut kill| kill.take()) {
            let _ = kill.send(());
        }
        self.inner.shared.mark_crashed("worker shut down");
        for task in &self.inner.tasks {
            task.abort();
        }
    }
}

/// Spawn the reader, writer and handshake tasks shared by both constructors.
fn start<R, W>(
    name: String,
    mut reader: R,
    mut writer: W,
    options: WorkerOptions,
    handler: Arc<dyn InboundHandler>,
) -> Started
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (state, _) = watch::channel(WorkerState::Starting);
    let shared = Arc::new(Shared {
        name,
        state,
        handler,
    });
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (drained_tx, drained) = oneshot::channel::<()>();
    let mut tasks = Vec::with_capacity(4);

    // ── writer: outbound queue → worker stdin ───────────────────────
    let writer_shared = Arc::clone(&shared);
    tasks.push(
        tokio::spawn(async move {
            while let Some(mut line) = outbound_rx.recv().await {
                line.push('\n');
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    writer_shared.mark_crashed(&format!("write to worker failed: {e}"));
                    break;
                }
            }
        })
        .abort_handle(),
    );

    // ── reader: worker stdout → framer → handler ────────────────────
    let reader_shared = Arc::clone(&shared);
    let max_buffer_bytes = options.max_buffer_bytes;
    tasks.push(
        tokio::spawn(async move {
            let mut framer = LineFramer::new(max_buffer_bytes);
            let mut buf = vec![0u8; READ_CHUNK];
            let reason = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break "worker closed its output".to_string(),
                    Ok(n) => {
                        for framed in framer.push(&buf[..n]) {
                            reader_shared.deliver(framed);
                        }
                    }
                    Err(e) => break format!("read from worker failed: {e}"),
                }
            };
            for framed in framer.finish() {
                reader_shared.deliver(framed);
            }
            let _ = drained_tx.send(());
            reader_shared.mark_crashed(&reason);
        })
        .abort_handle(),
    );

    // ── handshake: wait, send `initialize`, become ready ────────────
    let handshake_shared = Arc::clone(&shared);
    let handshake_tx = outbound.clone();
    tasks.push(
        tokio::spawn(async move {
            tokio::time::sleep(options.handshake_delay).await;
            if *handshake_shared.state.borrow() != WorkerState::Starting {
                return;
            }
            let init = Request::call(
                format!("{HANDSHAKE_ID_PREFIX}{}", uuid::Uuid::new_v4()),
                "initialize",
                Some(json!({
                    "protocolVersion": options.protocol_version,
                    "capabilities": {},
                    "clientInfo": {
                        "name": options.client_name,
                        "version": options.client_version,
                    }
                })),
            );
            let sent = serde_json::to_string(&Message::Request(init))
                .ok()
                .is_some_and(|line| handshake_tx.send(line).is_ok());
            if !sent {
                handshake_shared.mark_crashed("failed to queue initialize request");
                return;
            }
            let ready = handshake_shared.state.send_if_modified(|state| {
                if *state == WorkerState::Starting {
                    *state = WorkerState::Ready;
                    true
                } else {
                    false
                }
            });
            if ready {
                info!(worker = %handshake_shared.name, "worker ready");
            }
        })
        .abort_handle(),
    );

    Started {
        shared,
        outbound,
        tasks,
        drained,
    }
}
