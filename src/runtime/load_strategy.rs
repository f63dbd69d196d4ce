// src/runtime/load_strategy.rs
//! Worker selection for incoming calls
//!
//! The basic strategy prefers an idle worker, then a busy one below its
//! limit, then grows the pool up to `max_workers`, and finally waits for
//! the pool to become available again.

use crate::runtime::events::PoolEvent;
use crate::runtime::worker_handle::WorkerHandle;
use crate::runtime::worker_pool::WorkerPool;
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

/// Chooses the worker that receives the next call
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    /// True when no worker can take a call and the pool cannot grow
    fn at_capacity(&self) -> bool;

    /// Pick a worker, waiting for one if necessary
    ///
    /// `Ok(None)` means the strategy declined to pick one.
    async fn select_worker(&self) -> Result<Option<Arc<WorkerHandle>>>;
}

/// Idle, then busy, then grow, then wait
pub struct BasicLoadStrategy {
    pool: Arc<WorkerPool>,
    min_workers: usize,
    max_workers: usize,
}

impl BasicLoadStrategy {
    pub fn new(pool: Arc<WorkerPool>, min_workers: usize, max_workers: usize) -> Self {
        Self {
            pool,
            min_workers,
            max_workers,
        }
    }

    async fn wait_for_available(&self) -> Result<Option<Arc<WorkerHandle>>> {
        let mut events = self.pool.subscribe();

        // Re-check after subscribing so an event sent in between is not missed
        if let Some(worker) = self.pool.available_worker() {
            return Ok(Some(worker));
        }

        debug!("Pool at capacity, waiting for a worker");
        loop {
            match events.recv().await {
                Ok(PoolEvent::PoolAvailable(worker)) => return Ok(Some(worker)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    trace!("Availability waiter lagged by {} events", skipped);
                    if let Some(worker) = self.pool.available_worker() {
                        return Ok(Some(worker));
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(PoolError::IllegalState(
                        "pool event channel closed".to_string(),
                    ))
                }
            }

            if self.pool.is_closed() {
                return Err(PoolError::IllegalState("worker pool is shut down".to_string()));
            }
        }
    }
}

#[async_trait]
impl LoadStrategy for BasicLoadStrategy {
    fn at_capacity(&self) -> bool {
        self.pool.available_count() == 0 && self.pool.worker_count() >= self.max_workers
    }

    async fn select_worker(&self) -> Result<Option<Arc<WorkerHandle>>> {
        if let Some(added) = self
            .pool
            .ensure_minimum_workers(self.min_workers)?
            .into_iter()
            .next()
        {
            return Ok(Some(added));
        }

        if let Some(worker) = self.pool.available_worker() {
            return Ok(Some(worker));
        }

        if let Some(worker) = self.pool.try_add_worker(self.max_workers)? {
            return Ok(Some(worker));
        }

        self.wait_for_available().await
    }
}

/// Builds a custom strategy for a pool
pub type LoadStrategyFactory =
    Arc<dyn Fn(Arc<WorkerPool>, &PoolConfig) -> Arc<dyn LoadStrategy> + Send + Sync>;

/// Load strategy selection
#[derive(Clone)]
pub enum LoadStrategyKind {
    Basic,
    Custom(LoadStrategyFactory),
}

impl LoadStrategyKind {
    /// Resolve a strategy by configuration name
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(LoadStrategyKind::Basic),
            other => Err(PoolError::InvalidConfig(format!(
                "unknown load strategy '{}'",
                other
            ))),
        }
    }

    pub fn build(&self, pool: Arc<WorkerPool>, config: &PoolConfig) -> Arc<dyn LoadStrategy> {
        match self {
            LoadStrategyKind::Basic => Arc::new(BasicLoadStrategy::new(
                pool,
                config.min_workers,
                config.max_workers,
            )),
            LoadStrategyKind::Custom(factory) => factory(pool, config),
        }
    }
}

impl fmt::Debug for LoadStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategyKind::Basic => f.write_str("Basic"),
            LoadStrategyKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::in_process::InProcessLauncher;
    use crate::runtime::worker_handle::WorkerConfig;
    use crate::worker::demo;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn create_pool(max_concurrent_calls: usize) -> Arc<WorkerPool> {
        let (events, _) = broadcast::channel(256);
        let config = WorkerConfig {
            module_name: demo::MODULE_NAME.to_string(),
            max_concurrent_calls,
            ..Default::default()
        };
        WorkerPool::new(config, Arc::new(InProcessLauncher::new(demo::registry())), events)
    }

    #[test]
    fn test_from_name() {
        assert!(matches!(
            LoadStrategyKind::from_name("Basic").unwrap(),
            LoadStrategyKind::Basic
        ));
        assert!(LoadStrategyKind::from_name("round-robin").is_err());
    }

    #[tokio::test]
    async fn test_select_warms_up_minimum() {
        let pool = create_pool(10);
        let strategy = BasicLoadStrategy::new(Arc::clone(&pool), 1, 4);
        assert!(!strategy.at_capacity());

        let worker = strategy.select_worker().await.unwrap().unwrap();
        assert_eq!(pool.worker_count(), 1);
        worker.ping().await.unwrap();

        // An idle worker is reused rather than growing the pool
        let again = strategy.select_worker().await.unwrap().unwrap();
        assert_eq!(again.id(), worker.id());
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_grows_until_max_then_waits() {
        let pool = create_pool(1);
        let strategy = Arc::new(BasicLoadStrategy::new(Arc::clone(&pool), 1, 2));

        let first = strategy.select_worker().await.unwrap().unwrap();
        first.ping().await.unwrap();
        let slow_first = first.invoke("sleepThenReturn", vec![json!(100), json!(1)]);

        let second = strategy.select_worker().await.unwrap().unwrap();
        assert_ne!(second.id(), first.id());
        second.ping().await.unwrap();
        let slow_second = second.invoke("sleepThenReturn", vec![json!(100), json!(2)]);
        assert!(strategy.at_capacity());

        let waiter = {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.select_worker().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        slow_first.await.unwrap();
        slow_second.await.unwrap();
        let selected = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(selected.id() == first.id() || selected.id() == second.id());
        assert_eq!(pool.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_custom_factory() {
        struct Never;

        #[async_trait]
        impl LoadStrategy for Never {
            fn at_capacity(&self) -> bool {
                false
            }

            async fn select_worker(&self) -> Result<Option<Arc<WorkerHandle>>> {
                Ok(None)
            }
        }

        let factory: LoadStrategyFactory =
            Arc::new(|_pool: Arc<WorkerPool>, _config: &PoolConfig| -> Arc<dyn LoadStrategy> {
                Arc::new(Never)
            });
        let kind = LoadStrategyKind::Custom(factory);
        let strategy = kind.build(create_pool(1), &PoolConfig::new(demo::MODULE_NAME));
        assert!(strategy.select_worker().await.unwrap().is_none());
        assert_eq!(format!("{:?}", kind), "Custom(..)");
    }
}
