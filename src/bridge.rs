//! One worker, its pending table and its sessions, wired together.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker_channel::{WorkerChannel, WorkerState};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, StartError};
use crate::health::{HealthReport, StatusReport};
use crate::logger::BridgeMetrics;
use crate::multiplexer::{Multiplexer, MultiplexerOptions};
use crate::pending::PendingTable;
use crate::session::SessionRegistry;
use crate::sink::{ChannelSink, SharedSink};

pub struct Bridge {
    config: BridgeConfig,
    multiplexer: Multiplexer,
    sweeper: JoinHandle<()>,
}

/// A session's event stream, opened with [`Bridge::open_event_stream`]. The
/// transport forwards `frames` to its client. Dropping the stream, or the client
/// going away, ends the session unless another stream has replaced this one.
pub struct EventStream {
    pub session_id: String,
    pub sink: Arc<ChannelSink>,
    pub frames: mpsc::UnboundedReceiver<String>,
    sessions: SessionRegistry,
    keepalive: JoinHandle<()>,
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.keepalive.abort();
        let sink: SharedSink = self.sink.clone();
        self.sessions.stream_disconnected(&self.session_id, &sink);
    }
}

impl Bridge {
    /// Spawn the configured worker and start the session sweeper.
    pub fn start(config: BridgeConfig) -> Result<Self, StartError> {
        let command = config.worker_command()?;
        let pending = PendingTable::new();
        let worker = WorkerChannel::spawn(
            &command,
            config.worker_options(),
            Arc::new(pending.clone()),
        )?;
        Ok(Self::assemble(config, worker, pending))
    }

    /// Bridge to a worker that is already connected through `reader`/`writer`.
    pub fn from_io<R, W>(name: impl Into<String>, reader: R, writer: W, config: BridgeConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = PendingTable::new();
        let worker = WorkerChannel::from_io(
            name,
            reader,
            writer,
            config.worker_options(),
            Arc::new(pending.clone()),
        );
        Self::assemble(config, worker, pending)
    }

    fn assemble(config: BridgeConfig, worker: WorkerChannel, pending: PendingTable) -> Self {
        let sessions = SessionRegistry::new(config.session_config());
        let sweeper = sessions.spawn_sweeper();
        let options = MultiplexerOptions {
            request_timeout: config.request_timeout(),
            reject_unknown_sessions: config.reject_unknown_sessions,
        };
        info!(
            worker = %worker.name(),
            timeout_ms = config.request_timeout_ms,
            "bridge started"
        );
        let multiplexer = Multiplexer::new(worker, pending, sessions, options, BridgeMetrics::new());
        Self {
            config,
            multiplexer,
            sweeper,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn sessions(&self) -> &SessionRegistry {
        self.multiplexer.sessions()
    }

    pub fn pending(&self) -> &PendingTable {
        self.multiplexer.pending()
    }

    pub fn worker(&self) -> &WorkerChannel {
        self.multiplexer.worker()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker().state()
    }

    pub fn is_ready(&self) -> bool {
        self.worker().is_ready()
    }

    pub async fn wait_until_ready(&self) -> Result<(), BridgeError> {
        Ok(self.worker().wait_until_ready().await?)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::new(self.worker_state(), self.sessions().len(), self.pending().len())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::new(&self.config.protocol_version, self.worker_state())
    }

    /// Open a push stream for `session_id` (or a fresh session). The first frames
    /// announce the message endpoint and the session id; keep-alive pings follow.
    pub fn open_event_stream(
        &self,
        session_id: Option<&str>,
        messages_path: &str,
    ) -> Result<EventStream, BridgeError> {
        let session = match session_id {
            Some(known) if self.config.reject_unknown_sessions => self.sessions().touch(known)?,
            requested => self.sessions().get_or_create(requested),
        };
        let (sink, frames) = ChannelSink::event_stream();

        // announce before attaching, so a dead stream never replaces a live one
        if let Err(err) = announce(&sink, messages_path, &session.id) {
            if session.created {
                self.sessions().terminate(&session.id);
            }
            return Err(err);
        }
        self.sessions().attach_sink(&session.id, sink.clone())?;

        let sessions = self.sessions().clone();
        let session_id = session.id.clone();
        let watched: SharedSink = sink.clone();
        let keepalive = sink.spawn_keepalive(self.config.keepalive(), move || {
            sessions.stream_disconnected(&session_id, &watched);
        });
        info!(session = %session.id, "event stream opened");
        Ok(EventStream {
            session_id: session.id,
            sink,
            frames,
            sessions: self.sessions().clone(),
            keepalive,
        })
    }

    /// Close an event stream. Its session ends with it unless a newer stream
    /// took over.
    pub fn close_event_stream(&self, stream: EventStream) {
        info!(session = %stream.session_id, "event stream closed");
        drop(stream);
    }

    /// Kill the worker, fail everything outstanding and drop every session.
    pub fn shutdown(&self) {
        self.sweeper.abort();
        self.worker().shutdown();
        let failed = self.pending().fail_all("bridge shut down");
        let sessions = self.sessions().terminate_all();
        info!(failed, sessions, "bridge shut down");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn announce(sink: &ChannelSink, messages_path: &str, session_id: &str) -> Result<(), BridgeError> {
    sink.send_endpoint(messages_path, session_id)
        .and_then(|()| sink.send_connection(session_id))
        .map_err(|e| {
            warn!(session = %session_id, error = %e, "event stream closed before it was announced");
            BridgeError::StreamClosed(session_id.to_string())
        })
}
