// src/worker/mod.rs
//! Worker side of the pool
//!
//! A worker hosts one [`WorkModule`] chosen by name during `init` and answers
//! the parent's operations over a line-oriented channel. [`run_worker`] binds
//! the dispatcher to stdin/stdout for real child processes; the in-process
//! launcher drives [`WorkerDispatcher`] over in-memory channels instead.

pub mod demo;
pub mod dispatcher;
pub mod module;
pub mod stdio;

pub use dispatcher::{ServeExit, WorkerDispatcher};
pub use module::{MethodResult, ModuleRegistry, Outcome, Responder, WorkModule};
pub use stdio::run_worker;
