use serde_json::json;
use thiserror::Error;
use worker_channel::jsonrpc::{INTERNAL_ERROR, INVALID_REQUEST, SERVER_ERROR};
use worker_channel::{ChannelError, Id, Response};

use crate::config::ConfigError;

/// Every way a dispatched request can fail. Each variant maps onto a JSON-RPC
/// error envelope through [`BridgeError::into_response`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("request {id} timed out after {timeout_ms} ms")]
    RequestTimeout { id: Id, timeout_ms: u64 },

    #[error("request id {0} is already outstanding")]
    DuplicateRequestId(Id),

    #[error("Invalid or missing session ID: {0}")]
    UnknownSession(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("event stream for session {0} closed before it was announced")]
    StreamClosed(String),
}

impl BridgeError {
    pub fn code(&self) -> i64 {
        match self {
            BridgeError::WorkerUnavailable(_)
            | BridgeError::RequestTimeout { .. }
            | BridgeError::StreamClosed(_) => INTERNAL_ERROR,
            BridgeError::DuplicateRequestId(_) | BridgeError::InvalidRequest(_) => INVALID_REQUEST,
            BridgeError::UnknownSession(_) => SERVER_ERROR,
        }
    }

    /// Stable machine-readable name, carried in `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::WorkerUnavailable(_) => "worker_unavailable",
            BridgeError::RequestTimeout { .. } => "request_timeout",
            BridgeError::DuplicateRequestId(_) => "duplicate_request_id",
            BridgeError::UnknownSession(_) => "unknown_session",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::StreamClosed(_) => "stream_closed",
        }
    }

    pub fn into_response(self, id: Id) -> Response {
        let code = self.code();
        let kind = self.kind();
        Response::fail(id, code, self.to_string(), Some(json!({ "kind": kind })))
    }
}

impl From<ChannelError> for BridgeError {
    fn from(err: ChannelError) -> Self {
        BridgeError::WorkerUnavailable(err.to_string())
    }
}

/// Failure to bring a bridge up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_channel::WorkerState;

    #[test]
    fn codes_follow_the_failure() {
        assert_eq!(BridgeError::WorkerUnavailable("x".into()).code(), -32603);
        assert_eq!(
            BridgeError::RequestTimeout {
                id: Id::Number(1),
                timeout_ms: 10
            }
            .code(),
            -32603
        );
        assert_eq!(BridgeError::DuplicateRequestId(Id::Number(1)).code(), -32600);
        assert_eq!(BridgeError::InvalidRequest("no id".into()).code(), -32600);
        assert_eq!(BridgeError::UnknownSession("s".into()).code(), -32000);
        assert_eq!(BridgeError::StreamClosed("s".into()).code(), -32603);
    }

    #[test]
    fn closed_stream_is_not_an_unknown_session() {
        let err = BridgeError::StreamClosed("abc".into());
        assert_eq!(err.kind(), "stream_closed");
        assert_eq!(
            err.to_string(),
            "event stream for session abc closed before it was announced"
        );
    }

    #[test]
    fn envelope_keeps_the_original_id() {
        let rsp = BridgeError::UnknownSession("abc".into()).into_response(Id::from("7"));
        assert_eq!(rsp.id, Id::from("7"));
        let err = rsp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "Invalid or missing session ID: abc");
        assert_eq!(err.data, Some(json!({"kind": "unknown_session"})));
        assert!(rsp.result.is_none());
    }

    #[test]
    fn channel_errors_become_unavailable() {
        let err: BridgeError = ChannelError::WorkerUnavailable {
            state: WorkerState::Starting,
        }
        .into();
        assert_eq!(
            err,
            BridgeError::WorkerUnavailable("worker unavailable (state: starting)".into())
        );
    }
}
