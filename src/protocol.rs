//! JSON-RPC 2.0 message types and notification payloads.
//!
//! Requests flow client → server (`execute`, `control`, `hook_status`);
//! notifications flow server → client with no `id`. Everything here is plain
//! data -- serialization only, no behavior.

use crate::config::JSONRPC_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incoming JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Parameters for the `execute` method.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    /// The shell command to execute.
    pub command: String,
    /// Optional execution timeout in seconds. Estimated when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Optional correlation id echoed back in notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

/// Control action kinds for a running process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlKind {
    Pause,
    Resume,
    Cancel,
}

impl ControlKind {
    /// The past-tense status word used in responses and notifications.
    #[must_use]
    pub fn status(self) -> &'static str {
        match self {
            Self::Pause => "paused",
            Self::Resume => "resumed",
            Self::Cancel => "canceled",
        }
    }
}

/// Parameters for the `control` method.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub kind: ControlKind,
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Payload of a `process.output` notification.
///
/// A logical line larger than the chunk limit is fragmented into ordered
/// chunks; every chunk except the last carries `truncated: true`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOutput {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub data: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

/// Payload of `process.started|paused|resumed|canceled` notifications.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
}

/// Payload of the terminal `process.completed|failed` notification.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionUpdate {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub exit_code: Option<i32>,
    pub execution_time: f64,
    pub timed_out: bool,
    /// Service error code, set when the execution was cut short by a timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub early_completion_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_completion_time: Option<f64>,
    pub time_saved: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_marker: Option<String>,
}

/// Payload of the `connected` notification sent on session creation.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub version: &'static str,
    pub capabilities: &'static [&'static str],
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            version: env!("CARGO_PKG_VERSION"),
            capabilities: &["execute", "control", "stream"],
        }
    }
}

/// Build a JSON-RPC success response.
#[must_use]
pub fn response(result: Value, id: Option<Value>) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "result": result,
        "id": id,
    })
}

/// Build a JSON-RPC error response.
#[must_use]
pub fn error_response(code: i64, message: &str, id: Option<Value>) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": { "code": code, "message": message },
        "id": id,
    })
}

/// Build a JSON-RPC notification (no id).
#[must_use]
pub fn notification<P: Serialize>(method: &str, params: P) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}
