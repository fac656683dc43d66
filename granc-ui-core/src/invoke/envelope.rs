//! JSON envelopes exchanged with callers of the bridge.
use crate::grpc::metadata::MetadataEntry;
use serde::{Deserialize, Serialize};

/// A call request: optional timeout, metadata and the messages to send, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

impl RequestEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Everything observed during a call, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub headers: Vec<MetadataEntry>,
    pub error: Option<RpcError>,
    pub responses: Vec<ResponseMessage>,
    pub requests: RequestStats,
    pub trailers: Vec<MetadataEntry>,
}

/// A rendered message. When `is_error` is set, `message` holds the reason it could not be
/// rendered instead of the message itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub message: serde_json::Value,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ResponseMessage {
    pub fn ok(message: serde_json::Value) -> Self {
        Self {
            message,
            is_error: false,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            message: serde_json::Value::String(reason.into()),
            is_error: true,
        }
    }
}

/// How many request messages were queued and how many were actually sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: usize,
    pub sent: usize,
}

/// A non-OK terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub details: Vec<ResponseMessage>,
}
