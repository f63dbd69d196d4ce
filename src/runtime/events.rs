// src/runtime/events.rs
//! Typed pool event channel

use crate::runtime::worker_handle::WorkerHandle;
use crate::utils::errors::PoolError;
use std::fmt;
use std::sync::Arc;

/// Capacity of the broadcast channel; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events published by the pool and its workers
#[derive(Clone)]
pub enum PoolEvent {
    WorkerAdded { worker_id: u64 },
    WorkerRemoved { worker_id: u64 },
    ProcessCreated { worker_id: u64, pid: u32 },
    ProcessExited {
        worker_id: u64,
        pid: Option<u32>,
        code: Option<i32>,
        signal: Option<i32>,
    },
    InactivityTimeout { worker_id: u64 },

    /// The number of available workers went from zero to one
    PoolAvailable(Arc<WorkerHandle>),

    /// The number of available workers dropped to zero
    PoolUnavailable,

    CallDropped { method: String },
    CallRejected { method: String },
    CallQueued { method: String },
    CallFailed { method: String, error: PoolError },
}

impl fmt::Debug for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::WorkerAdded { worker_id } => write!(f, "WorkerAdded({})", worker_id),
            PoolEvent::WorkerRemoved { worker_id } => write!(f, "WorkerRemoved({})", worker_id),
            PoolEvent::ProcessCreated { worker_id, pid } => {
                write!(f, "ProcessCreated({}, pid {})", worker_id, pid)
            }
            PoolEvent::ProcessExited {
                worker_id,
                pid,
                code,
                signal,
            } => write!(
                f,
                "ProcessExited({}, pid {:?}, code {:?}, signal {:?})",
                worker_id, pid, code, signal
            ),
            PoolEvent::InactivityTimeout { worker_id } => {
                write!(f, "InactivityTimeout({})", worker_id)
            }
            PoolEvent::PoolAvailable(worker) => write!(f, "PoolAvailable({})", worker.id()),
            PoolEvent::PoolUnavailable => write!(f, "PoolUnavailable"),
            PoolEvent::CallDropped { method } => write!(f, "CallDropped({})", method),
            PoolEvent::CallRejected { method } => write!(f, "CallRejected({})", method),
            PoolEvent::CallQueued { method } => write!(f, "CallQueued({})", method),
            PoolEvent::CallFailed { method, error } => {
                write!(f, "CallFailed({}, {})", method, error)
            }
        }
    }
}
