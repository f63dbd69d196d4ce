// src/runtime/mod.rs
//! Parent-side runtime
//!
//! - **Process Manager**: launching worker processes and talking to them
//! - **Worker Handle**: one worker's lifecycle, calls and recycling
//! - **Worker Pool**: handles indexed by availability
//! - **Strategies**: worker selection and at-capacity policies
//! - **Call Dispatcher**: admission and routing of calls
//! - **Process Pool**: the public facade
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                     ProcessPool                       │
//! │   invoke ──► CallDispatcher ──► LoadStrategy          │
//! │                   │                  │                │
//! │          AtCapacityStrategy      WorkerPool           │
//! │                                      │                │
//! │          ┌──────────────┬────────────┴─┐              │
//! │          │ WorkerHandle │ WorkerHandle │ ...          │
//! │          └──────┬───────┴──────┬───────┘              │
//! └─────────────────┼──────────────┼──────────────────────┘
//!              child process  child process
//! ```

pub mod at_capacity;
pub mod call;
pub mod call_dispatcher;
pub mod events;
pub mod in_process;
pub mod load_strategy;
pub mod process_manager;
pub mod process_pool;
pub mod worker_handle;
pub mod worker_pool;
pub mod worker_proxy;

// Re-export commonly used types
pub use at_capacity::{AtCapacityStrategy, AtCapacityStrategyKind};
pub use call::{Call, CallCompletion};
pub use call_dispatcher::CallDispatcher;
pub use events::PoolEvent;
pub use in_process::InProcessLauncher;
pub use load_strategy::{BasicLoadStrategy, LoadStrategy, LoadStrategyKind};
pub use process_manager::{CommandLauncher, ExitInfo, Launcher, ProcessLink};
pub use process_pool::{ProcessPool, ProcessPoolBuilder};
pub use worker_handle::{WorkerConfig, WorkerHandle, WorkerState, WorkerStats, WorkingStatus};
pub use worker_pool::{PoolStats, WorkerPool};
pub use worker_proxy::{ProxyMethod, WorkerProxy};
