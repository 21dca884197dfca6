use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use worker_channel::WorkerState;

/// Liveness payload for a `/health`-style endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthReport {
    /// `ok` while the worker is ready, `degraded` otherwise.
    pub status: String,
    pub worker_ready: bool,
    pub worker_state: WorkerState,
    pub sessions: usize,
    pub pending: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Capabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

/// Discovery payload for a `/mcp/status`-style endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusReport {
    pub protocol: String,
    pub version: String,
    pub transports: Vec<String>,
    pub status: WorkerState,
    pub capabilities: Capabilities,
}

impl HealthReport {
    pub fn new(worker_state: WorkerState, sessions: usize, pending: usize) -> Self {
        let worker_ready = worker_state == WorkerState::Ready;
        Self {
            status: if worker_ready { "ok" } else { "degraded" }.to_string(),
            worker_ready,
            worker_state,
            sessions,
            pending,
            timestamp: Utc::now(),
        }
    }
}

impl StatusReport {
    pub fn new(protocol_version: &str, worker_state: WorkerState) -> Self {
        Self {
            protocol: "mcp".to_string(),
            version: protocol_version.to_string(),
            transports: vec!["streamable-http".to_string(), "sse".to_string()],
            status: worker_state,
            capabilities: Capabilities::default(),
        }
    }
}
