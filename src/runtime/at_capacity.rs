// src/runtime/at_capacity.rs
//! What happens to a call when no worker can take it
//!
//! | strategy | call outcome              | handled |
//! |----------|---------------------------|---------|
//! | drop     | resolves with `null`      | yes     |
//! | error    | rejects with `AtCapacity` | yes     |
//! | queue    | left for the dispatcher   | no      |
//!
//! An unhandled call stays admitted; the dispatcher pauses admission until
//! the pool is available again.

use crate::runtime::call::Call;
use crate::runtime::events::PoolEvent;
use crate::utils::errors::{PoolError, Result};
use metrics::counter;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity policy applied by the dispatcher
pub trait AtCapacityStrategy: Send + Sync {
    /// Settle or keep `call`; returns true when the call needs no worker
    fn handle(&self, call: &Arc<Call>) -> bool;
}

/// Resolve the call with `null`
pub struct DropStrategy {
    events: broadcast::Sender<PoolEvent>,
}

impl AtCapacityStrategy for DropStrategy {
    fn handle(&self, call: &Arc<Call>) -> bool {
        debug!("At capacity, dropping {}", call);
        counter!("forkpool_calls_dropped_total").increment(1);
        let _ = self.events.send(PoolEvent::CallDropped {
            method: call.method().to_string(),
        });
        call.resolve(Value::Null);
        true
    }
}

/// Reject the call with an at-capacity error
pub struct ErrorStrategy {
    events: broadcast::Sender<PoolEvent>,
}

impl AtCapacityStrategy for ErrorStrategy {
    fn handle(&self, call: &Arc<Call>) -> bool {
        debug!("At capacity, rejecting {}", call);
        counter!("forkpool_calls_rejected_total").increment(1);
        let _ = self.events.send(PoolEvent::CallRejected {
            method: call.method().to_string(),
        });
        call.reject(PoolError::AtCapacity(format!(
            "no worker available for '{}'",
            call.method()
        )));
        true
    }
}

/// Keep the call until a worker frees up
pub struct QueueStrategy {
    events: broadcast::Sender<PoolEvent>,
}

impl AtCapacityStrategy for QueueStrategy {
    fn handle(&self, call: &Arc<Call>) -> bool {
        debug!("At capacity, queueing {}", call);
        let _ = self.events.send(PoolEvent::CallQueued {
            method: call.method().to_string(),
        });
        false
    }
}

/// Builds a custom capacity policy from the pool's event channel
pub type AtCapacityStrategyFactory =
    Arc<dyn Fn(broadcast::Sender<PoolEvent>) -> Arc<dyn AtCapacityStrategy> + Send + Sync>;

/// At-capacity strategy selection
#[derive(Clone)]
pub enum AtCapacityStrategyKind {
    Drop,
    Error,
    Queue,
    Custom(AtCapacityStrategyFactory),
}

impl AtCapacityStrategyKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(AtCapacityStrategyKind::Drop),
            "error" => Ok(AtCapacityStrategyKind::Error),
            "queue" => Ok(AtCapacityStrategyKind::Queue),
            other => Err(PoolError::InvalidConfig(format!(
                "unknown at-capacity strategy '{}'",
                other
            ))),
        }
    }

    pub fn build(&self, events: broadcast::Sender<PoolEvent>) -> Arc<dyn AtCapacityStrategy> {
        match self {
            AtCapacityStrategyKind::Drop => Arc::new(DropStrategy { events }),
            AtCapacityStrategyKind::Error => Arc::new(ErrorStrategy { events }),
            AtCapacityStrategyKind::Queue => Arc::new(QueueStrategy { events }),
            AtCapacityStrategyKind::Custom(factory) => factory(events),
        }
    }
}

impl fmt::Debug for AtCapacityStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtCapacityStrategyKind::Drop => f.write_str("Drop"),
            AtCapacityStrategyKind::Error => f.write_str("Error"),
            AtCapacityStrategyKind::Queue => f.write_str("Queue"),
            AtCapacityStrategyKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
