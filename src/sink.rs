//! Push delivery to a session's long-lived connection.
//!
//! The bridge never touches sockets. Whatever transport holds the connection
//! hands the session a [`PushSink`] and drains it on its own side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("push sink is closed")]
    Closed,

    #[error("push sink write failed: {0}")]
    Write(String),
}

/// One push connection. Writes must not block; a failed write means the
/// connection is gone.
pub trait PushSink: Send + Sync + 'static {
    fn write(&self, payload: &str) -> Result<(), SinkError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub type SharedSink = Arc<dyn PushSink>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    /// One payload per item, unframed.
    Raw,
    /// `text/event-stream` framing: `data: <payload>\n\n`.
    EventStream,
}

/// Sink backed by an unbounded channel; the transport owns the receiver.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    format: SinkFormat,
}

impl ChannelSink {
    pub fn new(format: SinkFormat) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                format,
            }),
            rx,
        )
    }

    pub fn raw() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::new(SinkFormat::Raw)
    }

    pub fn event_stream() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::new(SinkFormat::EventStream)
    }

    pub fn format(&self) -> SinkFormat {
        self.format
    }

    fn send_frame(&self, frame: String) -> Result<(), SinkError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;
        tx.send(frame).map_err(|_| SinkError::Closed)
    }

    /// A named event. Raw sinks get the bare data.
    pub fn send_event(&self, event: &str, data: &str) -> Result<(), SinkError> {
        match self.format {
            SinkFormat::Raw => self.send_frame(data.to_string()),
            SinkFormat::EventStream => self.send_frame(format!("event: {event}\ndata: {data}\n\n")),
        }
    }

    /// Tell the client where to post messages for this session.
    pub fn send_endpoint(&self, messages_path: &str, session_id: &str) -> Result<(), SinkError> {
        self.send_event("endpoint", &format!("{messages_path}?sessionId={session_id}"))
    }

    pub fn send_connection(&self, session_id: &str) -> Result<(), SinkError> {
        self.write(
            &json!({
                "type": "connection",
                "sessionId": session_id,
                "message": "Connected to worker bridge",
            })
            .to_string(),
        )
    }

    /// Event-stream comment that keeps intermediaries from timing the connection out.
    /// No-op for raw sinks.
    pub fn ping(&self) -> Result<(), SinkError> {
        match self.format {
            SinkFormat::Raw => {
                if self.is_closed() {
                    Err(SinkError::Closed)
                } else {
                    Ok(())
                }
            }
            SinkFormat::EventStream => self.send_frame(": ping\n\n".to_string()),
        }
    }

    /// Ping every `interval` until a ping fails, then run `on_closed` once.
    pub fn spawn_keepalive<F>(self: &Arc<Self>, interval: Duration, on_closed: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sink.ping().is_err() {
                    debug!("keep-alive stopped, sink closed");
                    on_closed();
                    break;
                }
            }
        })
    }
}

impl PushSink for ChannelSink {
    fn write(&self, payload: &str) -> Result<(), SinkError> {
        match self.format {
            SinkFormat::Raw => self.send_frame(payload.to_string()),
            SinkFormat::EventStream => self.send_frame(format!("data: {payload}\n\n")),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}

/// Fan-out to several connections of one session. Members whose writes fail are
/// dropped; the broadcast itself fails once no member is left.
#[derive(Default)]
pub struct BroadcastSink {
    members: Mutex<Vec<SharedSink>>,
    closed: AtomicBool,
}

impl BroadcastSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, member: SharedSink) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            member.close();
            return Err(SinkError::Closed);
        }
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(member);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PushSink for BroadcastSink {
    fn write(&self, payload: &str) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        members.retain(|member| member.write(payload).is_ok());
        if members.is_empty() {
            Err(SinkError::Closed)
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let members =
            std::mem::take(&mut *self.members.lock().unwrap_or_else(PoisonError::into_inner));
        for member in members {
            member.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
