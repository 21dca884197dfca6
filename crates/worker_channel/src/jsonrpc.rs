use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON‑RPC 2.0 core types exchanged with a worker over stdin/stdout.
///
/// These structs mirror the [JSON‑RPC 2.0 spec](https://www.jsonrpc.org/specification).
/// They are **transport‑agnostic**: the same types travel over the worker pipe and
/// through whatever HTTP/event-stream layer sits in front of the bridge.
///
/// ```ignore
/// use serde_json::json;
/// use worker_channel::jsonrpc::{Id, Request};
///
/// let req = Request::call(Id::Number(1), "tools/list", Some(json!({})));
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Start of the implementation-defined server error range.
pub const SERVER_ERROR: i64 = -32000;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "\"{s}\""),
            Id::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_owned())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// `"result": null` is a legitimate result, so a present `null` must not collapse into `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Id,
}

/// Anything that can travel over the worker pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// Why a well-formed JSON value is still not a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    Batch,
    MissingVersion,
    UnsupportedVersion(String),
    Shape(String),
    ResultAndError,
    NeitherResultNorError,
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::Batch => f.write_str("batch messages are not supported"),
            ClassifyError::MissingVersion => f.write_str("missing jsonrpc version"),
            ClassifyError::UnsupportedVersion(v) => write!(f, "unsupported jsonrpc version {v}"),
            ClassifyError::Shape(reason) => write!(f, "not a request or response: {reason}"),
            ClassifyError::ResultAndError => f.write_str("response carries both result and error"),
            ClassifyError::NeitherResultNorError => {
                f.write_str("response carries neither result nor error")
            }
        }
    }
}

impl Message {
    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ClassifyError> {
        if value.is_array() {
            return Err(ClassifyError::Batch);
        }
        match value.get("jsonrpc").map(|v| v.as_str()) {
            None => return Err(ClassifyError::MissingVersion),
            Some(Some(JSONRPC_VERSION)) => {}
            Some(other) => {
                return Err(ClassifyError::UnsupportedVersion(
                    other.unwrap_or("<non-string>").to_owned(),
                ));
            }
        }

        let message: Message =
            serde_json::from_value(value).map_err(|e| ClassifyError::Shape(e.to_string()))?;
        if let Message::Response(rsp) = &message {
            match (&rsp.result, &rsp.error) {
                (Some(_), Some(_)) => return Err(ClassifyError::ResultAndError),
                (None, None) => return Err(ClassifyError::NeitherResultNorError),
                _ => {}
            }
        }
        Ok(message)
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request(req) => req.id.as_ref(),
            Message::Response(rsp) => Some(&rsp.id),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(rsp: Response) -> Self {
        Message::Response(rsp)
    }
}

// -----------------------------------------------------------------------------
// Helper constructors – make it ergonomic to build requests and responses.
// -----------------------------------------------------------------------------
impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: impl Into<Id>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_result_survives_a_roundtrip() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let msg = Message::from_value(serde_json::from_str(raw).unwrap()).unwrap();
        let Message::Response(rsp) = msg else {
            panic!("expected a response");
        };
        assert_eq!(rsp.result, Some(Value::Null));
        assert_eq!(serde_json::to_value(&rsp).unwrap(), json!({"jsonrpc":"2.0","id":7,"result":null}));
    }

    #[test]
    fn requests_and_notifications_are_classified() {
        let call = Message::from_value(json!({"jsonrpc":"2.0","id":"a","method":"ping"})).unwrap();
        assert_eq!(call.id(), Some(&Id::String("a".into())));

        let note = Message::from_value(json!({"jsonrpc":"2.0","method":"notifications/progress"}))
            .unwrap();
        match note {
            Message::Request(req) => assert!(req.is_notification()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert_eq!(
            Message::from_value(json!([{"jsonrpc":"2.0","id":1,"method":"x"}])),
            Err(ClassifyError::Batch)
        );
        assert_eq!(
            Message::from_value(json!({"id":1,"method":"x"})),
            Err(ClassifyError::MissingVersion)
        );
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"1.0","id":1,"method":"x"})),
            Err(ClassifyError::UnsupportedVersion("1.0".into()))
        );
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"2.0","id":1})),
            Err(ClassifyError::NeitherResultNorError)
        );
        assert_eq!(
            Message::from_value(
                json!({"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}})
            ),
            Err(ClassifyError::ResultAndError)
        );
        assert!(matches!(
            Message::from_value(json!({"jsonrpc":"2.0","a":1})),
            Err(ClassifyError::Shape(_))
        ));
    }

    #[test]
    fn string_and_number_ids_are_distinct() {
        assert_ne!(Id::from("1"), Id::from(1));
        assert_eq!(Id::from("1").to_string(), "\"1\"");
        assert_eq!(Id::from(1).to_string(), "1");
    }

    #[test]
    fn fail_builds_an_error_envelope() {
        let rsp = Response::fail(Id::Number(3), INTERNAL_ERROR, "boom", Some(json!({"kind":"x"})));
        assert!(rsp.is_error());
        assert_eq!(
            serde_json::to_value(&rsp).unwrap(),
            json!({"jsonrpc":"2.0","id":3,"error":{"code":-32603,"message":"boom","data":{"kind":"x"}}})
        );
    }
}
