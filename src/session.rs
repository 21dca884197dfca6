use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;
use worker_channel::{Request, Response};

use crate::error::BridgeError;
use crate::sink::SharedSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            history_capacity: 100,
        }
    }
}

/// One request/response pair, numbered per session for resumable delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub seq: u64,
    pub request: Request,
    pub response: Response,
    pub recorded_at: DateTime<Utc>,
}

struct Session {
    created_at: DateTime<Utc>,
    last_activity: Instant,
    sink: Option<SharedSink>,
    history: VecDeque<Exchange>,
    last_seq: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            last_activity: Instant::now(),
            sink: None,
            history: VecDeque::new(),
            last_seq: 0,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn snapshot(&self, id: &str, created: bool) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            created,
            created_at: self.created_at,
            idle_for: self.last_activity.elapsed(),
            has_sink: self.sink.is_some(),
            exchanges: self.history.len(),
            last_seq: self.last_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    /// Whether this call created the session.
    pub created: bool,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub has_sink: bool,
    pub exchanges: usize,
    pub last_seq: u64,
}

/// Client sessions keyed by opaque id. Mutations for one id are serialized by
/// the map entry; sinks are always closed after the entry is released.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Refresh a known session, or create one (under `id`, or a fresh random id).
    pub fn get_or_create(&self, id: Option<&str>) -> SessionSnapshot {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                session.touch();
                session.snapshot(&id, false)
            }
            Entry::Vacant(entry) => {
                let session = entry.insert(Session::new());
                info!(session = %id, "session created");
                session.snapshot(&id, true)
            }
        }
    }

    /// Refresh a session that must already exist.
    pub fn touch(&self, id: &str) -> Result<SessionSnapshot, BridgeError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))?;
        session.touch();
        Ok(session.snapshot(id, false))
    }

    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|s| s.snapshot(id, false))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Attach `sink` to the session, closing whichever sink it replaces.
    pub fn attach_sink(&self, id: &str, sink: SharedSink) -> Result<(), BridgeError> {
        let previous = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))?;
            session.touch();
            session.sink.replace(Arc::clone(&sink))
        };
        if let Some(previous) = previous {
            if !std::ptr::addr_eq(Arc::as_ptr(&previous), Arc::as_ptr(&sink)) {
                debug!(session = %id, "replacing push sink");
                previous.close();
            }
        }
        Ok(())
    }

    /// Detach without closing; the caller now owns the sink.
    pub fn detach_sink(&self, id: &str) -> Option<SharedSink> {
        self.sessions.get_mut(id).and_then(|mut s| s.sink.take())
    }

    pub fn sink(&self, id: &str) -> Option<SharedSink> {
        self.sessions.get(id).and_then(|s| s.sink.clone())
    }

    /// The session's push connection went away. The session goes with it.
    pub fn sink_disconnected(&self, id: &str) -> bool {
        let removed = self.remove(id);
        if removed {
            info!(session = %id, "push sink disconnected, session closed");
        }
        removed
    }

    /// Like [`Self::sink_disconnected`], but only while `sink` is still the
    /// session's sink. A stream that was already replaced leaves the session alone.
    pub fn stream_disconnected(&self, id: &str, sink: &SharedSink) -> bool {
        let removed = self.sessions.remove_if(id, |_, session| {
            session
                .sink
                .as_ref()
                .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(sink)))
        });
        sink.close();
        match removed {
            Some(_) => {
                info!(session = %id, "push stream disconnected, session closed");
                true
            }
            None => false,
        }
    }

    /// Append to the bounded history and return the exchange's sequence number.
    pub fn record_exchange(
        &self,
        id: &str,
        request: Request,
        response: Response,
    ) -> Result<u64, BridgeError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))?;
        session.touch();
        session.last_seq += 1;
        let seq = session.last_seq;
        session.history.push_back(Exchange {
            seq,
            request,
            response,
            recorded_at: Utc::now(),
        });
        while session.history.len() > self.config.history_capacity {
            session.history.pop_front();
        }
        Ok(seq)
    }

    pub fn history(&self, id: &str) -> Option<Vec<Exchange>> {
        self.sessions
            .get(id)
            .map(|s| s.history.iter().cloned().collect())
    }

    /// Exchanges with a sequence number greater than `seq`, oldest first.
    pub fn history_after(&self, id: &str, seq: u64) -> Option<Vec<Exchange>> {
        self.sessions.get(id).map(|s| {
            s.history
                .iter()
                .filter(|e| e.seq > seq)
                .cloned()
                .collect()
        })
    }

    pub fn terminate(&self, id: &str) -> bool {
        let removed = self.remove(id);
        if removed {
            info!(session = %id, "session terminated");
        }
        removed
    }

    fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                if let Some(sink) = session.sink {
                    sink.close();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every session idle for longer than the configured timeout.
    pub fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        let mut expired = Vec::new();
        self.sessions.retain(|id, session| {
            if session.last_activity.elapsed() > idle_timeout {
                expired.push((id.clone(), session.sink.take()));
                false
            } else {
                true
            }
        });

        expired
            .into_iter()
            .map(|(id, sink)| {
                if let Some(sink) = sink {
                    sink.close();
                }
                info!(session = %id, "idle session swept");
                id
            })
            .collect()
    }

    /// Run [`Self::sweep_idle`] every sweep interval until the registry is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sessions = Arc::downgrade(&self.sessions);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sessions) = sessions.upgrade() else {
                    break;
                };
                let registry = SessionRegistry {
                    sessions,
                    config: config.clone(),
                };
                let swept = registry.sweep_idle();
                if !swept.is_empty() {
                    debug!(count = swept.len(), "session sweep finished");
                }
            }
        })
    }

    pub fn terminate_all(&self) -> usize {
        self.ids().iter().filter(|id| self.remove(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, PushSink};
    use serde_json::json;
    use worker_channel::Id;

    fn exchange(n: i64) -> (Request, Response) {
        (
            Request::call(n, "ping", None),
            Response::success(Id::Number(n), json!(n)),
        )
    }

    #[tokio::test]
    async fn get_or_create_reports_creation() {
        let registry = SessionRegistry::default();
        let fresh = registry.get_or_create(None);
        assert!(fresh.created);
        assert!(Uuid::parse_str(&fresh.id).is_ok());

        let again = registry.get_or_create(Some(fresh.id.as_str()));
        assert!(!again.created);

        let named = registry.get_or_create(Some("client-supplied"));
        assert!(named.created);
        assert_eq!(named.id, "client-supplied");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_of_one_id_creates_once() {
        let registry = SessionRegistry::default();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(Some("shared")).created
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn history_keeps_the_latest_entries() {
        let registry = SessionRegistry::default();
        let id = registry.get_or_create(None).id;
        for n in 1..=150 {
            let (req, rsp) = exchange(n);
            assert_eq!(registry.record_exchange(&id, req, rsp).unwrap(), n as u64);
        }
        let history = registry.history(&id).unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history.first().unwrap().seq, 51);
        assert_eq!(history.last().unwrap().seq, 150);

        let tail = registry.history_after(&id, 148).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![149, 150]);
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let registry = SessionRegistry::default();
        let (req, rsp) = exchange(1);
        assert_eq!(
            registry.record_exchange("nope", req, rsp),
            Err(BridgeError::UnknownSession("nope".into()))
        );
        let (sink, _rx) = ChannelSink::raw();
        assert!(registry.attach_sink("nope", sink).is_err());
        assert!(registry.touch("nope").is_err());
        assert!(registry.history("nope").is_none());
    }

    #[tokio::test]
    async fn attaching_replaces_and_closes_the_old_sink() {
        let registry = SessionRegistry::default();
        let id = registry.get_or_create(None).id;
        let (first, _rx1) = ChannelSink::raw();
        let (second, _rx2) = ChannelSink::raw();

        registry.attach_sink(&id, first.clone()).unwrap();
        registry.attach_sink(&id, first.clone()).unwrap();
        assert!(!first.is_closed());

        registry.attach_sink(&id, second.clone()).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());

        let detached = registry.detach_sink(&id).unwrap();
        assert!(!detached.is_closed());
        assert!(registry.sink(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_sessions_and_closes_sinks() {
        let registry = SessionRegistry::default();
        let idle = registry.get_or_create(Some("idle")).id;
        let busy = registry.get_or_create(Some("busy")).id;
        let (sink, mut rx) = ChannelSink::event_stream();
        registry.attach_sink(&idle, sink.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        registry.get_or_create(Some(busy.as_str()));
        tokio::time::advance(Duration::from_secs(101)).await;

        assert_eq!(registry.sweep_idle(), vec![idle.clone()]);
        assert!(sink.is_closed());
        assert_eq!(rx.recv().await, None);
        assert!(registry.contains(&busy));
        assert!(!registry.contains(&idle));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_on_its_interval() {
        let registry = SessionRegistry::new(SessionConfig {
            idle_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            history_capacity: 4,
        });
        registry.get_or_create(Some("a"));
        let sweeper = registry.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(registry.is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn disconnect_and_terminate() {
        let registry = SessionRegistry::default();
        registry.get_or_create(Some("a"));
        registry.get_or_create(Some("b"));
        registry.get_or_create(Some("c"));
        let (sink, _rx) = ChannelSink::raw();
        registry.attach_sink("c", sink.clone()).unwrap();

        assert!(registry.sink_disconnected("a"));
        assert!(!registry.sink_disconnected("a"));
        assert!(registry.terminate("b"));
        assert!(!registry.terminate("b"));
        assert_eq!(registry.terminate_all(), 1);
        assert!(sink.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn only_the_current_stream_ends_its_session() {
        let registry = SessionRegistry::default();
        let id = registry.get_or_create(None).id;
        let (old, _old_rx) = ChannelSink::event_stream();
        let (new, _new_rx) = ChannelSink::event_stream();
        let old: SharedSink = old;
        let new: SharedSink = new;
        registry.attach_sink(&id, old.clone()).unwrap();
        registry.attach_sink(&id, new.clone()).unwrap();

        assert!(!registry.stream_disconnected(&id, &old));
        assert!(registry.contains(&id));
        assert!(!new.is_closed());

        assert!(registry.stream_disconnected(&id, &new));
        assert!(!registry.contains(&id));
        assert!(new.is_closed());
        assert!(!registry.stream_disconnected(&id, &new));
    }
}
