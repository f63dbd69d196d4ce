// src/runtime/process_pool.rs
//! Process pool facade
//!
//! Wires the worker pool, the strategies and the dispatcher together from a
//! [`PoolConfig`]:
//!
//! ```text
//! ProcessPool::invoke ──► CallDispatcher ──► LoadStrategy ──► WorkerPool
//!                              │                                  │
//!                       AtCapacityStrategy                 WorkerHandle ──► child
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> forkpool::Result<()> {
//! use forkpool::{PoolConfig, ProcessPool};
//! use serde_json::json;
//!
//! let pool = ProcessPool::new(PoolConfig::new("demo"))?;
//! pool.start().await?;
//! let reply = pool.invoke("returnResult", json!("hello")).await?;
//! assert_eq!(reply, json!("hello"));
//! pool.shutdown(false).await?;
//! # Ok(())
//! # }
//! ```

use crate::runtime::at_capacity::AtCapacityStrategyKind;
use crate::runtime::call::Call;
use crate::runtime::call_dispatcher::CallDispatcher;
use crate::runtime::events::{PoolEvent, EVENT_CHANNEL_CAPACITY};
use crate::runtime::load_strategy::LoadStrategyKind;
use crate::runtime::process_manager::Launcher;
use crate::runtime::worker_pool::{PoolStats, WorkerPool};
use crate::runtime::worker_proxy::WorkerProxy;
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info};

/// Builder for a [`ProcessPool`] with non-default parts
pub struct ProcessPoolBuilder {
    config: PoolConfig,
    launcher: Option<Arc<dyn Launcher>>,
    load_strategy: Option<LoadStrategyKind>,
    at_capacity_strategy: Option<AtCapacityStrategyKind>,
}

impl ProcessPoolBuilder {
    /// Start workers with `launcher` instead of the configured command
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Override the configured load strategy
    pub fn load_strategy(mut self, kind: LoadStrategyKind) -> Self {
        self.load_strategy = Some(kind);
        self
    }

    /// Override the configured at-capacity strategy
    pub fn at_capacity_strategy(mut self, kind: AtCapacityStrategyKind) -> Self {
        self.at_capacity_strategy = Some(kind);
        self
    }

    pub fn build(self) -> Result<ProcessPool> {
        let config = self.config.normalize()?;

        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(config.launcher()?),
        };
        let load_strategy = match self.load_strategy {
            Some(kind) => kind,
            None => LoadStrategyKind::from_name(&config.load_strategy)?,
        };
        let at_capacity_strategy = match self.at_capacity_strategy {
            Some(kind) => kind,
            None => AtCapacityStrategyKind::from_name(&config.at_capacity_strategy)?,
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let workers = WorkerPool::new(config.worker_config(), launcher, events.clone());
        let dispatcher = CallDispatcher::new(
            Arc::clone(&workers),
            load_strategy.build(Arc::clone(&workers), &config),
            at_capacity_strategy.build(events),
        );

        debug!(
            "Process pool for '{}' ({}..{} workers, {:?} / {:?})",
            config.worker_module,
            config.min_workers,
            config.max_workers,
            load_strategy,
            at_capacity_strategy
        );

        Ok(ProcessPool {
            config,
            workers,
            dispatcher,
            interface: OnceCell::new(),
        })
    }
}

/// Pool of worker processes exposing remote method calls
pub struct ProcessPool {
    config: PoolConfig,
    workers: Arc<WorkerPool>,
    dispatcher: Arc<CallDispatcher>,
    interface: OnceCell<Vec<String>>,
}

impl ProcessPool {
    /// Create a pool from configuration; no worker starts until the first
    /// call or [`start`](Self::start)
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: PoolConfig) -> ProcessPoolBuilder {
        ProcessPoolBuilder {
            config,
            launcher: None,
            load_strategy: None,
            at_capacity_strategy: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Fork `min_workers` workers and wait until they answer a ping
    pub async fn start(&self) -> Result<()> {
        let added = self.workers.ensure_minimum_workers(self.config.min_workers)?;
        info!("Starting {} workers", added.len());

        for result in join_all(added.iter().map(|worker| worker.ping())).await {
            result?;
        }
        Ok(())
    }

    /// Call `method` on some worker
    ///
    /// `args` is an argument array, a single argument, or `null` for none.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let (call, completion) = Call::new(method, args);
        self.dispatcher.dispatch(call);
        completion.await
    }

    /// Method names exported by the work module, discovered once
    pub async fn worker_interface(&self) -> Result<Vec<String>> {
        self.interface
            .get_or_try_init(|| async {
                let worker = match self.workers.available_worker() {
                    Some(worker) => worker,
                    None => match self.workers.workers().into_iter().next() {
                        Some(worker) => worker,
                        None => self.workers.add_worker()?,
                    },
                };

                let mut iface = worker.discover_interface().await?;
                iface.sort();
                debug!("Discovered worker interface: {:?}", iface);
                Ok::<_, PoolError>(iface)
            })
            .await
            .cloned()
    }

    /// Proxy with one callable per exported method
    pub async fn worker_proxy(&self) -> Result<WorkerProxy> {
        let methods = self.worker_interface().await?;
        Ok(WorkerProxy::new(Arc::clone(&self.dispatcher), methods))
    }

    /// Reject queued calls and destroy every worker
    ///
    /// Without `force`, workers get `force_kill_timeout` to exit on their own.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        info!("Shutting down process pool (force: {})", force);
        self.dispatcher.close();
        self.workers.shutdown(force).await
    }

    pub fn stats(&self) -> PoolStats {
        self.workers.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.workers.subscribe()
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.workers
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if self.workers.is_closed() {
            return;
        }

        self.dispatcher.close();
        let workers = self.workers.workers();
        if !workers.is_empty() {
            debug!("Process pool dropped, killing {} workers", workers.len());
        }
        for worker in workers {
            // The signal goes out before the future is first polled
            drop(worker.kill(true, true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::in_process::InProcessLauncher;
    use crate::worker::demo;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pool(config: PoolConfig) -> ProcessPool {
        ProcessPool::builder(config)
            .launcher(Arc::new(InProcessLauncher::new(demo::registry())))
            .build()
            .unwrap()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            ..PoolConfig::new(demo::MODULE_NAME)
        }
    }

    #[tokio::test]
    async fn test_invoke_styles() {
        let pool = pool(config());
        pool.start().await.unwrap();
        assert_eq!(pool.stats().idle, 1);

        assert_eq!(pool.invoke("returnResult", json!("foo")).await.unwrap(), json!("foo"));
        assert_eq!(
            pool.invoke("promiseResultLater", json!(["bar"])).await.unwrap(),
            json!("bar")
        );
        assert_eq!(
            pool.invoke("returnTwoResults", json!([1, 2])).await.unwrap(),
            json!([1, 2])
        );

        match pool.invoke("callbackErrorLater", Value::Null).await.unwrap_err() {
            PoolError::Remote(remote) => assert_eq!(remote.message, "I suck"),
            other => panic!("unexpected error: {:?}", other),
        }

        pool.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_started_workers_are_available() {
        let pool = pool(PoolConfig {
            max_workers: 1,
            max_concurrent_calls: 1,
            at_capacity_strategy: "error".to_string(),
            ..config()
        });
        pool.start().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.at_capacity, 0);
        assert_eq!(pool.worker_pool().available_count(), 1);

        for i in 0..3 {
            assert_eq!(pool.invoke("returnResult", json!(i)).await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_worker_proxy() {
        let pool = pool(config());
        let proxy = pool.worker_proxy().await.unwrap();
        assert!(proxy.has_method("returnResult"));
        assert!(proxy.methods().windows(2).all(|w| w[0] <= w[1]));

        let method = proxy.method("returnResult").unwrap();
        assert_eq!(method.call(json!("foo")).await.unwrap(), json!("foo"));

        let (tx, rx) = oneshot::channel();
        method.call_with(json!("cb"), move |outcome| {
            let _ = tx.send(outcome);
        });
        assert_eq!(rx.await.unwrap().unwrap(), json!("cb"));

        assert!(matches!(
            proxy.method("launchMissiles").unwrap_err(),
            PoolError::MethodNotFound(_)
        ));
        assert_eq!(pool.worker_interface().await.unwrap(), proxy.methods());
    }

    #[tokio::test]
    async fn test_invocation_timeout_boundary() {
        let pool = pool(PoolConfig {
            invocation_timeout_ms: Some(500),
            ..config()
        });
        pool.start().await.unwrap();

        let err = pool
            .invoke("sleepThenReturn", json!([700, "late"]))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let reply = pool
            .invoke("sleepThenReturn", json!([300, "early"]))
            .await
            .unwrap();
        assert_eq!(reply, json!("early"));
    }

    #[tokio::test]
    async fn test_recycling_through_pool() {
        let pool = pool(PoolConfig {
            max_workers: 1,
            max_total_calls: Some(3),
            ..config()
        });
        pool.start().await.unwrap();
        let first_pid = pool.worker_pool().workers()[0].pid();

        for i in 0..7 {
            assert_eq!(pool.invoke("returnResult", json!(i)).await.unwrap(), json!(i));
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert!(stats.totals.resets >= 2);
        assert_ne!(pool.worker_pool().workers()[0].pid(), first_pid);
        assert_eq!(stats.totals.calls_received, 7);
    }

    #[tokio::test]
    async fn test_grows_to_max_workers() {
        let pool = pool(PoolConfig {
            max_concurrent_calls: 1,
            ..config()
        });

        let calls: Vec<_> = (0..4)
            .map(|i| pool.invoke("sleepThenReturn", json!([50, i])))
            .collect();
        let replies = join_all(calls).await;
        for (i, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply.unwrap(), json!(i));
        }
        assert_eq!(pool.stats().workers, 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_calls() {
        let pool = pool(config());
        pool.start().await.unwrap();
        let mut events = pool.subscribe();

        pool.shutdown(false).await.unwrap();
        assert_eq!(pool.stats().workers, 0);
        assert!(pool.invoke("returnResult", json!(1)).await.is_err());

        let removed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let PoolEvent::WorkerRemoved { worker_id } = events.recv().await.unwrap() {
                    return worker_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_invalid_config() {
        assert!(ProcessPool::new(PoolConfig::default()).is_err());
        let config = PoolConfig {
            load_strategy: "random".to_string(),
            ..PoolConfig::new(demo::MODULE_NAME)
        };
        assert!(ProcessPool::new(config).is_err());
    }
}
