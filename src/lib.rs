// src/lib.rs
//! forkpool: process-pool remote invocation
//!
//! Keeps a pool of worker processes, each hosting a named work module, and
//! lets callers invoke module methods as single async calls while the pool
//! handles sizing, backpressure, timeouts and worker recycling.
//!
//! # Architecture
//!
//! - **pipe**: request/reply correlation with capacity, timeouts and retries
//! - **protocol**: JSON-lines wire format between parent and workers
//! - **runtime**: worker handles, the pool, strategies and the dispatcher
//! - **worker**: the child side that runs work modules
//! - **observability**: logging setup
//! - **utils**: configuration and errors

// Public module exports
pub mod observability;
pub mod pipe;
pub mod protocol;
pub mod runtime;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use runtime::process_pool::{ProcessPool, ProcessPoolBuilder};
pub use runtime::worker_proxy::WorkerProxy;
pub use utils::config::PoolConfig;
pub use utils::errors::{PoolError, RemoteError, Result};

use serde::Serialize;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Version stamp reported by `forkpool --version` and next to pool stats
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    /// Seconds since the epoch, 0 when the build script could not tell
    pub built_at: u64,
    pub rustc: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            built_at: env!("BUILD_TIMESTAMP").parse().unwrap_or(0),
            rustc: env!("RUSTC_VERSION"),
        }
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "forkpool {} ({}, {})", self.version, self.git_hash, self.rustc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(info.to_string().starts_with(&format!("forkpool {}", VERSION)));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["gitHash"], GIT_HASH);
        assert!(json["builtAt"].is_u64());
    }
}
