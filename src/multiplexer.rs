//! The facade transports call. It is the only component that touches the worker
//! channel, the pending table and the session registry together.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use worker_channel::{Id, Message, Request, Response, WorkerChannel};

use crate::error::BridgeError;
use crate::logger::BridgeMetrics;
use crate::pending::PendingTable;
use crate::session::SessionRegistry;
use crate::sink::SharedSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerOptions {
    pub request_timeout: Duration,
    /// Fail with `UnknownSession` instead of creating sessions for unseen ids.
    pub reject_unknown_sessions: bool,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            reject_unknown_sessions: false,
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// The session the exchange ran in. `None` only when the request was
    /// rejected before a session was resolved.
    pub session_id: Option<String>,
    pub response: Response,
}

#[derive(Clone, Debug)]
pub struct Multiplexer {
    worker: WorkerChannel,
    pending: PendingTable,
    sessions: SessionRegistry,
    options: MultiplexerOptions,
    metrics: BridgeMetrics,
}

impl Multiplexer {
    pub fn new(
        worker: WorkerChannel,
        pending: PendingTable,
        sessions: SessionRegistry,
        options: MultiplexerOptions,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            worker,
            pending,
            sessions,
            options,
            metrics,
        }
    }

    pub fn worker(&self) -> &WorkerChannel {
        &self.worker
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn options(&self) -> &MultiplexerOptions {
        &self.options
    }

    /// Send `request` to the worker and wait for its response. Never fails:
    /// errors come back as JSON-RPC error envelopes carrying the request id.
    pub async fn dispatch(
        &self,
        request: Request,
        session_id: Option<&str>,
        push_sink: Option<SharedSink>,
    ) -> Dispatched {
        let id = request.id.clone().unwrap_or(Id::Null);
        let (session_id, result) = self.run(request, session_id, push_sink).await;
        Dispatched {
            session_id,
            response: result.unwrap_or_else(|err| err.into_response(id)),
        }
    }

    /// Like [`Self::dispatch`] but keeps the failure typed.
    pub async fn try_dispatch(
        &self,
        request: Request,
        session_id: Option<&str>,
        push_sink: Option<SharedSink>,
    ) -> Result<Dispatched, BridgeError> {
        let (session_id, result) = self.run(request, session_id, push_sink).await;
        result.map(|response| Dispatched {
            session_id,
            response,
        })
    }

    /// Fire-and-forget. Notifications get no pending entry and no response.
    pub fn notify(&self, notification: Request) -> Result<(), BridgeError> {
        if !notification.is_notification() {
            return Err(BridgeError::InvalidRequest(
                "notifications must not carry an id".to_string(),
            ));
        }
        debug!(method = %notification.method, "forwarding notification");
        self.worker.send(&Message::Request(notification))?;
        Ok(())
    }

    async fn run(
        &self,
        request: Request,
        session_id: Option<&str>,
        push_sink: Option<SharedSink>,
    ) -> (Option<String>, Result<Response, BridgeError>) {
        let method = request.method.clone();
        let id = request.id.clone().unwrap_or(Id::Null);
        let started = Instant::now();
        self.metrics.started(&method);

        let mut session = None;
        let result = self
            .exchange(request, session_id, push_sink, &mut session)
            .await;

        self.metrics.finished(
            &method,
            session.as_deref(),
            result.as_ref(),
            started.elapsed(),
        );

        if let Some(session_id) = session.as_deref() {
            match &result {
                Ok(response) => self.push(session_id, response),
                Err(err) => self.push(session_id, &err.clone().into_response(id)),
            }
        }
        (session, result)
    }

    async fn exchange(
        &self,
        request: Request,
        session_id: Option<&str>,
        push_sink: Option<SharedSink>,
        session: &mut Option<String>,
    ) -> Result<Response, BridgeError> {
        let id = request.id.clone().ok_or_else(|| {
            BridgeError::InvalidRequest("request has no id; send it as a notification".to_string())
        })?;

        // claim the id before touching sessions, so a duplicate leaves no trace
        let pending = self.pending.register(
            id.clone(),
            session_id.map(str::to_string),
            self.options.request_timeout,
        )?;

        let resolved = match session_id {
            Some(known) if self.options.reject_unknown_sessions => self.sessions.touch(known)?,
            requested => self.sessions.get_or_create(requested),
        };
        let session_id = resolved.id;
        pending.assign_session(&session_id);
        *session = Some(session_id.clone());

        if let Some(sink) = push_sink {
            self.sessions.attach_sink(&session_id, sink)?;
        }

        // a failed send drops `pending`, which removes the registration
        self.worker.send(&Message::Request(request.clone()))?;
        debug!(%id, session = %session_id, "request sent to worker");

        let response = pending.wait().await?;

        if let Err(err) = self
            .sessions
            .record_exchange(&session_id, request, response.clone())
        {
            debug!(session = %session_id, error = %err, "session ended before the exchange was recorded");
        }
        Ok(response)
    }

    fn push(&self, session_id: &str, response: &Response) {
        let Some(sink) = self.sessions.sink(session_id) else {
            return;
        };
        let payload = match serde_json::to_string(response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %session_id, error = %e, "could not serialize response for push");
                return;
            }
        };
        if let Err(e) = sink.write(&payload) {
            debug!(session = %session_id, error = %e, "push sink write failed");
            self.sessions.sink_disconnected(session_id);
        }
    }
}
