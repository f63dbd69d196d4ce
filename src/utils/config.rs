// src/utils/config.rs
//! Pool configuration
//!
//! Options are read from an optional file (TOML, YAML or JSON, picked by
//! extension) and then from `FORKPOOL__*` environment variables, e.g.
//! `FORKPOOL__MAX_WORKERS=8`. `PoolConfig::normalize` validates the result.

use crate::runtime::at_capacity::AtCapacityStrategyKind;
use crate::runtime::load_strategy::LoadStrategyKind;
use crate::runtime::process_manager::CommandLauncher;
use crate::runtime::worker_handle::WorkerConfig;
use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "FORKPOOL";

/// Configuration for a process pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Name of the work module each worker loads during `init` (required)
    pub worker_module: String,

    /// Executable started for each worker (default: the current executable)
    pub worker_program: Option<PathBuf>,

    /// Arguments passed to the worker executable
    pub worker_args: Vec<String>,

    /// Extra environment for worker processes
    pub worker_env: Vec<(String, String)>,

    /// Minimum number of workers kept alive
    pub min_workers: usize,

    /// Maximum number of workers
    pub max_workers: usize,

    /// Idle time before a worker is reclaimed (None = never)
    pub inactivity_timeout_ms: Option<u64>,

    /// Per-call timeout (None = unbounded)
    pub invocation_timeout_ms: Option<u64>,

    /// Drain grace period before a reset escalates to a kill
    pub flush_timeout_ms: u64,

    /// Grace period between a graceful kill request and SIGKILL
    pub force_kill_timeout_ms: u64,

    /// Per-worker in-flight call ceiling
    pub max_concurrent_calls: usize,

    /// Calls a worker handles before it is recycled (None = never)
    pub max_total_calls: Option<u64>,

    /// Load strategy name
    pub load_strategy: String,

    /// At-capacity strategy name
    pub at_capacity_strategy: String,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_module: String::new(),
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            worker_env: vec![],
            min_workers: 1,
            max_workers: default_max_workers(),
            inactivity_timeout_ms: None,
            invocation_timeout_ms: Some(30_000),
            flush_timeout_ms: 5_000,
            force_kill_timeout_ms: 5_000,
            max_concurrent_calls: 10,
            max_total_calls: None,
            load_strategy: "basic".to_string(),
            at_capacity_strategy: "queue".to_string(),
        }
    }
}

impl PoolConfig {
    /// Create a default configuration for the given work module
    pub fn new(worker_module: impl Into<String>) -> Self {
        Self {
            worker_module: worker_module.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: PoolConfig = builder.build()?.try_deserialize()?;
        config.normalize()
    }

    /// Validate option bounds and strategy names
    pub fn normalize(self) -> Result<Self> {
        if self.worker_module.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "worker_module is required".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_concurrent_calls == 0 {
            return Err(PoolError::InvalidConfig(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.max_total_calls == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_total_calls must be at least 1".to_string(),
            ));
        }

        LoadStrategyKind::from_name(&self.load_strategy)?;
        AtCapacityStrategyKind::from_name(&self.at_capacity_strategy)?;

        Ok(self)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_ms.map(Duration::from_millis)
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    /// Per-worker options derived from the pool options
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            module_name: self.worker_module.clone(),
            inactivity_timeout: self.inactivity_timeout(),
            invocation_timeout: self.invocation_timeout(),
            flush_timeout: self.flush_timeout(),
            force_kill_timeout: self.force_kill_timeout(),
            max_concurrent_calls: self.max_concurrent_calls,
            max_total_calls: self.max_total_calls,
        }
    }

    /// Launcher for the configured worker command
    pub fn launcher(&self) -> Result<CommandLauncher> {
        let program = match &self.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                PoolError::ProcessSpawnFailed(format!("Failed to get current executable: {}", e))
            })?,
        };

        Ok(CommandLauncher::new(program)
            .args(self.worker_args.clone())
            .envs(self.worker_env.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::new("demo");
        assert_eq!(config.min_workers, 1);
        assert!(config.max_workers >= 1);
        assert_eq!(config.invocation_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.flush_timeout(), Duration::from_secs(5));
        assert_eq!(config.force_kill_timeout(), Duration::from_secs(5));
        assert_eq!(config.inactivity_timeout(), None);
        assert_eq!(config.max_total_calls, None);
        assert_eq!(config.load_strategy, "basic");
        assert_eq!(config.at_capacity_strategy, "queue");
        assert!(config.normalize().is_ok());
    }

    #[test]
    fn test_normalize_rejects_bad_bounds() {
        assert!(PoolConfig::default().normalize().is_err());

        let config = PoolConfig {
            min_workers: 4,
            max_workers: 2,
            ..PoolConfig::new("demo")
        };
        assert!(config.normalize().is_err());

        let config = PoolConfig {
            max_concurrent_calls: 0,
            ..PoolConfig::new("demo")
        };
        assert!(config.normalize().is_err());

        let config = PoolConfig {
            max_total_calls: Some(0),
            ..PoolConfig::new("demo")
        };
        assert!(config.normalize().is_err());

        let config = PoolConfig {
            at_capacity_strategy: "panic".to_string(),
            ..PoolConfig::new("demo")
        };
        assert!(config.normalize().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "worker_module = \"demo\"\nmax_workers = 3\nmax_total_calls = 50\nat_capacity_strategy = \"drop\""
        )
        .unwrap();

        let config = PoolConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.worker_module, "demo");
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_total_calls, Some(50));
        assert_eq!(config.at_capacity_strategy, "drop");
        // Untouched options keep their defaults
        assert_eq!(config.flush_timeout_ms, 5_000);
    }

    #[test]
    fn test_worker_config() {
        let config = PoolConfig {
            inactivity_timeout_ms: Some(250),
            max_total_calls: Some(3),
            ..PoolConfig::new("demo")
        };
        let worker = config.worker_config();
        assert_eq!(worker.module_name, "demo");
        assert_eq!(worker.inactivity_timeout, Some(Duration::from_millis(250)));
        assert_eq!(worker.max_total_calls, Some(3));
        assert_eq!(worker.max_concurrent_calls, 10);
    }
}
