use thiserror::Error;

use crate::worker::WorkerState;

/// Errors surfaced by the worker channel to whoever sends through it.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("worker unavailable (state: {state})")]
    WorkerUnavailable { state: WorkerState },

    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Problems with bytes coming *from* the worker. These are logged and dropped,
/// they never reach a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed upstream message ({bytes} bytes): {reason}")]
    Malformed { bytes: usize, reason: String },

    #[error("buffered upstream data exceeded {max_bytes} bytes, buffer reset")]
    Overflow { max_bytes: usize },

    #[error("upstream message is not JSON-RPC: {reason}")]
    NotJsonRpc { reason: String },
}
