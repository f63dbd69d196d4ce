// src/utils/errors.rs
//! Error types shared by the pool, the pipes and the worker runtime

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced to callers of the pool
///
/// Every variant is `Clone` so a single failure can settle a caller's future
/// and still be re-raised on the pool event channel.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// A call or a send exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The at-capacity policy refused the call
    #[error("At capacity: {0}")]
    AtCapacity(String),

    /// The child process or its channels failed
    #[error("Worker transport error: {0}")]
    Transport(String),

    /// The child process could not be started
    #[error("Failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    /// A work module method failed inside the worker
    #[error("{0}")]
    Remote(RemoteError),

    /// Operation not permitted in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A load strategy resolved no worker without reporting capacity
    #[error("Load strategy resolved no worker without reporting capacity")]
    NoWorkerSelected,

    /// Proxy lookup for a method the worker does not export
    #[error("Worker method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PoolError {
    /// True for deadline failures, whether local or reported by the worker
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout(_))
    }

    /// True when the at-capacity policy rejected the call
    pub fn is_at_capacity(&self) -> bool {
        matches!(self, PoolError::AtCapacity(_))
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(e: config::ConfigError) -> Self {
        PoolError::InvalidConfig(e.to_string())
    }
}

/// Serializable `{type, message, stack}` triple carried by error replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error type name (e.g. "Error", "TimeoutError")
    #[serde(rename = "type")]
    pub kind: String,

    /// Human readable message
    pub message: String,

    /// Backtrace or origin description, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Create an error with the generic "Error" type
    pub fn new(message: impl Into<String>) -> Self {
        Self::typed("Error", message)
    }

    /// Create an error with an explicit type name
    pub fn typed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker method panicked".to_string()
        };
        Self::typed("Panic", message)
    }

    /// Reconstitute the local error type for a reply received from a worker
    pub fn into_error(self) -> PoolError {
        match self.kind.as_str() {
            "TimeoutError" => PoolError::Timeout(self.message),
            "AtCapacityError" => PoolError::AtCapacity(self.message),
            _ => PoolError::Remote(self),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<PoolError> for RemoteError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Remote(remote) => remote,
            PoolError::Timeout(msg) => RemoteError::typed("TimeoutError", msg),
            PoolError::AtCapacity(msg) => RemoteError::typed("AtCapacityError", msg),
            other => RemoteError::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_wire_shape() {
        let err = RemoteError::new("I suck").with_stack("at worker");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["message"], "I suck");
        assert_eq!(json["stack"], "at worker");
    }

    #[test]
    fn test_reconstitution() {
        let timeout = RemoteError::typed("TimeoutError", "slow").into_error();
        assert!(timeout.is_timeout());

        let capacity = RemoteError::typed("AtCapacityError", "full").into_error();
        assert!(capacity.is_at_capacity());

        match RemoteError::new("boom").into_error() {
            PoolError::Remote(remote) => assert_eq!(remote.message, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_panic_payload() {
        let err = RemoteError::from_panic(Box::new("exploded"));
        assert_eq!(err.kind, "Panic");
        assert_eq!(err.message, "exploded");

        let err = RemoteError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.message, "owned");
    }
}
