//! Correlation of outgoing request ids to the callers waiting on them.
//!
//! The table is the only place where a caller gets resolved: by the matching
//! response, by its deadline, or by a worker crash. Whichever happens first removes
//! the entry, so later arrivals for the same id find nothing and are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use worker_channel::{HANDSHAKE_ID_PREFIX, Id, InboundHandler, Message, Response};

use crate::error::BridgeError;

pub type Completion = Result<Response, BridgeError>;

#[derive(Debug)]
struct PendingEntry {
    completion: oneshot::Sender<Completion>,
    session_id: Option<String>,
    registered_at: Instant,
    generation: u64,
    timer: AbortHandle,
}

/// Snapshot of one outstanding request, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Outstanding {
    pub id: Id,
    pub session_id: Option<String>,
    pub age: Duration,
}

#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<Id, PendingEntry>>,
    next_generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("outstanding", &self.entries.len())
            .finish()
    }
}

/// The caller's half of a registration. Dropping it before completion removes
/// the entry.
#[derive(Debug)]
pub struct PendingResponse {
    id: Id,
    generation: u64,
    rx: Option<oneshot::Receiver<Completion>>,
    entries: Arc<DashMap<Id, PendingEntry>>,
}

impl PendingResponse {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Tag the registration with the session it ended up running in.
    pub fn assign_session(&self, session_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(&self.id)
            && entry.generation == self.generation
        {
            entry.session_id = Some(session_id.to_string());
        }
    }

    pub async fn wait(mut self) -> Completion {
        let Some(rx) = self.rx.take() else {
            return Err(BridgeError::WorkerUnavailable(
                "pending request already awaited".to_string(),
            ));
        };
        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::WorkerUnavailable(
                "pending request was discarded".to_string(),
            ))
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let generation = self.generation;
        if let Some((id, entry)) = self
            .entries
            .remove_if(&self.id, |_, entry| entry.generation == generation)
        {
            entry.timer.abort();
            debug!(%id, "caller abandoned request");
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as outstanding and start its deadline.
    pub fn register(
        &self,
        id: Id,
        session_id: Option<String>,
        deadline: Duration,
    ) -> Result<PendingResponse, BridgeError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateRequestId(id)),
            Entry::Vacant(slot) => {
                let timer = self.spawn_deadline(id.clone(), generation, deadline);
                slot.insert(PendingEntry {
                    completion: tx,
                    session_id,
                    registered_at: Instant::now(),
                    generation,
                    timer,
                });
            }
        }

        debug!(%id, "request registered");
        Ok(PendingResponse {
            id,
            generation,
            rx: Some(rx),
            entries: Arc::clone(&self.entries),
        })
    }

    fn spawn_deadline(&self, id: Id, generation: u64, deadline: Duration) -> AbortHandle {
        let entries = Arc::clone(&self.entries);
        let timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some((id, entry)) =
                entries.remove_if(&id, |_, entry| entry.generation == generation)
            {
                warn!(%id, timeout_ms, "request timed out");
                let _ = entry
                    .completion
                    .send(Err(BridgeError::RequestTimeout { id, timeout_ms }));
            }
        })
        .abort_handle()
    }

    /// Complete the caller waiting on `response.id`. Unknown or late ids are
    /// dropped and reported as `false`.
    pub fn resolve(&self, response: Response) -> bool {
        let Some((id, entry)) = self.entries.remove(&response.id) else {
            match &response.id {
                Id::String(s) if s.starts_with(HANDSHAKE_ID_PREFIX) => {
                    debug!(id = %response.id, "handshake acknowledged by worker")
                }
                _ => warn!(id = %response.id, "dropping response for unknown request id"),
            }
            return false;
        };

        entry.timer.abort();
        debug!(
            %id,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "request resolved"
        );
        if entry.completion.send(Ok(response)).is_err() {
            debug!(%id, "caller went away before the response arrived");
        }
        true
    }

    /// Fail every outstanding request with `WorkerUnavailable`. Returns how many.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<Id> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.timer.abort();
                let _ = entry
                    .completion
                    .send(Err(BridgeError::WorkerUnavailable(reason.to_string())));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn outstanding(&self) -> Vec<Outstanding> {
        self.entries
            .iter()
            .map(|e| Outstanding {
                id: e.key().clone(),
                session_id: e.session_id.clone(),
                age: e.registered_at.elapsed(),
            })
            .collect()
    }
}

impl InboundHandler for PendingTable {
    fn on_message(&self, message: Message) {
        match message {
            Message::Response(rsp) => {
                self.resolve(rsp);
            }
            Message::Request(req) if req.is_notification() => {
                debug!(method = %req.method, "dropping notification from worker")
            }
            Message::Request(req) => {
                warn!(method = %req.method, id = ?req.id, "dropping request initiated by worker")
            }
        }
    }

    fn on_worker_exit(&self, reason: &str) {
        let failed = self.fail_all(reason);
        if failed > 0 {
            warn!(failed, %reason, "failed outstanding requests after worker exit");
        }
    }
}
