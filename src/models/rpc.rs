//! JSON-RPC record types for the inbound and outbound streams.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::error::ProxyError;

/// Client-chosen correlation id. String and integer forms are both accepted
/// and preserved exactly in responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&RequestId> for Value {
    fn from(id: &RequestId) -> Self {
        match id {
            RequestId::Number(n) => Self::from(*n),
            RequestId::String(s) => Self::String(s.clone()),
        }
    }
}

/// One inbound JSON-RPC record. A record without an `id` is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl InboundRecord {
    /// The request object forwarded to the remote endpoint, with the
    /// `jsonrpc` member normalized to `"2.0"`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".to_string(), Value::from("2.0"));
        if let Some(id) = &self.id {
            obj.insert("id".to_string(), Value::from(id));
        }
        obj.insert("method".to_string(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".to_string(), params.clone());
        }
        Value::Object(obj)
    }
}

/// JSON-RPC error object carried by an outbound record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&ProxyError> for ErrorObject {
    fn from(err: &ProxyError) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("kind".to_string(), Value::String(err.kind().to_string()));
        if let ProxyError::Remote { status, .. } = err {
            data.insert("status".to_string(), Value::from(*status));
        }
        Self {
            code: err.code(),
            message: err.to_string(),
            data: Some(Value::Object(data)),
        }
    }
}

/// One outbound JSON-RPC record. Every record carries `final` so consumers
/// need no per-method knowledge to detect sequence termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl OutboundRecord {
    /// Terminal success for a buffered call.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
            is_final: true,
        }
    }

    /// One non-terminal chunk of a streamed response.
    #[must_use]
    pub fn chunk(id: RequestId, chunk: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(chunk),
            error: None,
            is_final: false,
        }
    }

    /// Terminal record closing a streamed sequence.
    #[must_use]
    pub fn stream_end(id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(Value::Null),
            error: None,
            is_final: true,
        }
    }

    /// Terminal error rendered from the taxonomy. `id` is `None` only when
    /// the inbound line was unparseable.
    #[must_use]
    pub fn error(id: Option<RequestId>, err: &ProxyError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ErrorObject::from(err)),
            is_final: true,
        }
    }

    /// Terminal error passed through untouched from a remote JSON-RPC
    /// response envelope.
    #[must_use]
    pub fn remote_error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
            is_final: true,
        }
    }
}
