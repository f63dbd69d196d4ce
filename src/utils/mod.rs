// src/utils/mod.rs
//! Configuration and error types

pub mod config;
pub mod errors;

pub use config::PoolConfig;
pub use errors::{PoolError, RemoteError, Result};
