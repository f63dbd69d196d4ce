// src/protocol.rs
//! Wire protocol between the parent and its worker processes
//!
//! One JSON document per line over the child's stdin/stdout:
//!
//! ```text
//! parent → child   {"id": 7, "message": {"op": "invoke", "payload": {"method": "add", "args": [1, 2]}}}
//! child  → parent  {"id": 7, "message": 3}
//! child  → parent  {"id": 7, "error": {"type": "Error", "message": "...", "stack": "..."}}
//! ```

use crate::pipe::MessageId;
use crate::utils::errors::{PoolError, RemoteError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "lowercase")]
pub enum Op {
    /// Load the named work module
    Init {
        #[serde(rename = "moduleName")]
        module_name: String,
    },

    /// List the loaded module's method names
    Iface {},

    /// Liveness check
    Ping {},

    /// Acknowledge, then exit once outstanding replies are written
    Die {},

    /// Call a module method
    Invoke {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Init { .. } => "init",
            Op::Iface {} => "iface",
            Op::Ping {} => "ping",
            Op::Die {} => "die",
            Op::Invoke { .. } => "invoke",
        }
    }
}

/// Parent → child envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: MessageId,
    pub message: Op,
}

/// Child → parent envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: MessageId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn ok(id: MessageId, message: Value) -> Self {
        Self {
            id,
            message: Some(message),
            error: None,
        }
    }

    pub fn err(id: MessageId, error: RemoteError) -> Self {
        Self {
            id,
            message: None,
            error: Some(error),
        }
    }

    /// Split into the reply value or the reconstituted error
    ///
    /// A reply with neither field carries `null`.
    pub fn into_outcome(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(error.into_error()),
            None => Ok(self.message.unwrap_or(Value::Null)),
        }
    }
}

/// Reply to `init` and `ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidReply {
    pub pid: u32,
}

/// Reply to `iface`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceReply {
    pub iface: Vec<String>,
}

/// Serialize a frame as a single line (no trailing newline)
pub fn to_line<T: Serialize>(frame: &T) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Parse a single line into a frame
pub fn from_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| {
        PoolError::Transport(format!("malformed frame ({}): {}", e, truncate(line, 120)))
    })
}

/// Extract the request id from a line that failed to parse as a request
///
/// Lets the worker answer an unknown op with an error for the right id.
pub fn peek_id(line: &str) -> Option<(MessageId, Option<String>)> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let id = value.get("id")?.as_u64()?;
    let op = value
        .get("message")
        .and_then(|m| m.get("op"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((id, op))
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
