// src/runtime/call_dispatcher.rs
//! Call admission and routing
//!
//! Calls pass one at a time through an admission [`Pipe`] whose sender asks
//! the load strategy for a worker:
//!
//! ```text
//! dispatch(call) ──► admission pipe ──► at capacity? ──yes──► at-capacity strategy
//!                        ▲                  │                    │ handled: done
//!                        │                  no                   │ not handled:
//!                        │                  ▼                    │   pause + requeue,
//!                        │            select_worker()            │   resume when the
//!                        │                  │                    │   pool frees up
//!                        └── re-admit ◄─────┴──► call.invoke(worker)
//! ```
//!
//! The gate only admits the next call once the current one sits in its
//! worker's pipe, so the worker's load is visible to the next selection.

use crate::pipe::{Inbound, Outbound, Pipe, PipeConfig};
use crate::runtime::at_capacity::AtCapacityStrategy;
use crate::runtime::call::Call;
use crate::runtime::events::PoolEvent;
use crate::runtime::load_strategy::LoadStrategy;
use crate::runtime::worker_handle::{WorkerHandle, WorkerState};
use crate::runtime::worker_pool::WorkerPool;
use crate::utils::errors::{PoolError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

/// How an admitted call left the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admitted {
    /// Already settled, or settled by the capacity policy
    Settled,
    /// Sent to a worker
    Started,
    /// The picked worker stopped taking calls before the call reached it
    Retry,
}

type Admission = Pipe<Arc<Call>, Admitted>;

/// Routes calls to workers under the configured strategies
pub struct CallDispatcher {
    gate: Admission,
    pool: Arc<WorkerPool>,
    load_strategy: Arc<dyn LoadStrategy>,
    at_capacity: Arc<dyn AtCapacityStrategy>,
    /// A task is waiting for capacity to resume admission
    waiting: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl CallDispatcher {
    pub fn new(
        pool: Arc<WorkerPool>,
        load_strategy: Arc<dyn LoadStrategy>,
        at_capacity: Arc<dyn AtCapacityStrategy>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            gate: Pipe::new(PipeConfig {
                name: "dispatcher".to_string(),
                max_pending: 1,
                ..Default::default()
            }),
            pool,
            load_strategy,
            at_capacity,
            waiting: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&dispatcher);
        dispatcher
            .gate
            .set_sender(move |outbound: Outbound<Arc<Call>>| match weak.upgrade() {
                Some(dispatcher) => dispatcher.select_worker(outbound),
                None => Err(PoolError::IllegalState("dispatcher dropped".to_string())),
            });

        dispatcher
    }

    /// Admit `call`; its completion settles once a worker replies or a
    /// capacity policy decides
    pub fn dispatch(self: &Arc<Self>, call: Arc<Call>) {
        if self.closed.load(Ordering::SeqCst) {
            call.reject(PoolError::IllegalState("process pool is shut down".to_string()));
            return;
        }

        trace!("Admitting {}", call);
        let admitted = self.gate.send(Arc::clone(&call));
        let dispatcher = Arc::downgrade(self);

        tokio::spawn(async move {
            match admitted.await {
                Ok(Admitted::Retry) => match dispatcher.upgrade() {
                    Some(dispatcher) => dispatcher.dispatch(call),
                    None => {
                        call.reject(PoolError::IllegalState("dispatcher dropped".to_string()));
                    }
                },
                Ok(Admitted::Started) | Ok(Admitted::Settled) => {}
                Err(e) => {
                    debug!("Admission of {} failed: {}", call, e);
                    call.reject(e);
                }
            }
        });
    }

    /// Hand `call` to `worker`; the call is in the worker's pipe on return
    fn start(
        call: Arc<Call>,
        worker: Arc<WorkerHandle>,
        events: broadcast::Sender<PoolEvent>,
    ) -> Admitted {
        // The worker may have started flushing or been destroyed since it was picked
        if matches!(worker.state(), WorkerState::Flushing | WorkerState::Destroying) {
            debug!("Worker {} unavailable, re-admitting {}", worker.id(), call);
            return Admitted::Retry;
        }

        let reply = call.invoke(&worker);
        tokio::spawn(async move {
            if let Err(error) = reply.await {
                match &error {
                    PoolError::Remote(_) => {
                        debug!("{} failed on worker {}: {}", call, worker.id(), error)
                    }
                    _ => warn!("{} failed on worker {}: {}", call, worker.id(), error),
                }
                let _ = events.send(PoolEvent::CallFailed {
                    method: call.method().to_string(),
                    error,
                });
            }
        });
        Admitted::Started
    }

    /// Admission pipe sender
    fn select_worker(&self, outbound: Outbound<Arc<Call>>) -> Result<()> {
        let Outbound { id, payload: call } = outbound;

        if call.is_settled() {
            self.gate.receive(Inbound::reply(id, Admitted::Settled));
            return Ok(());
        }

        if self.load_strategy.at_capacity() {
            if self.at_capacity.handle(&call) {
                self.gate.receive(Inbound::reply(id, Admitted::Settled));
            } else {
                self.gate.set_paused(true);
                self.gate.reset_pending();
                self.resume_when_available();
            }
            return Ok(());
        }

        let strategy = Arc::clone(&self.load_strategy);
        let gate = self.gate.clone();
        let events = self.pool.events().clone();
        tokio::spawn(async move {
            let outcome = match strategy.select_worker().await {
                Ok(Some(worker)) => Ok(Self::start(Arc::clone(&call), worker, events)),
                Ok(None) => {
                    warn!("Load strategy selected no worker for {}", call);
                    Err(PoolError::NoWorkerSelected)
                }
                Err(e) => Err(e),
            };
            gate.receive(Inbound { id, outcome });
        });

        Ok(())
    }

    /// Resume admission once the load strategy reports free capacity
    fn resume_when_available(&self) {
        if self.waiting.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Admission paused until the pool has capacity");
        let mut events = self.pool.subscribe();
        let strategy = Arc::clone(&self.load_strategy);
        let gate = self.gate.clone();
        let pool = Arc::clone(&self.pool);
        let waiting = Arc::clone(&self.waiting);

        tokio::spawn(async move {
            loop {
                if !strategy.at_capacity() {
                    break;
                }
                if pool.is_closed() {
                    return;
                }
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }

            debug!("Pool has capacity, resuming admission");
            waiting.store(false, Ordering::SeqCst);
            gate.set_paused(false);
        });
    }

    /// Reject every admitted call and refuse new ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.gate
            .fail_all(PoolError::IllegalState("process pool is shut down".to_string()));
    }

    /// Calls waiting for admission
    pub fn queued_calls(&self) -> usize {
        self.gate.queued()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::at_capacity::AtCapacityStrategyKind;
    use crate::runtime::in_process::InProcessLauncher;
    use crate::runtime::load_strategy::BasicLoadStrategy;
    use crate::runtime::worker_handle::WorkerConfig;
    use crate::worker::demo;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    struct Setup {
        pool: Arc<WorkerPool>,
        dispatcher: Arc<CallDispatcher>,
    }

    /// One worker, one call at a time
    fn setup(policy: &str) -> Setup {
        let (events, _) = broadcast::channel(256);
        let config = WorkerConfig {
            module_name: demo::MODULE_NAME.to_string(),
            max_concurrent_calls: 1,
            ..Default::default()
        };
        let pool = WorkerPool::new(config, Arc::new(InProcessLauncher::new(demo::registry())), events);
        let load = Arc::new(BasicLoadStrategy::new(Arc::clone(&pool), 1, 1));
        let at_capacity = AtCapacityStrategyKind::from_name(policy)
            .unwrap()
            .build(pool.events().clone());
        let dispatcher = CallDispatcher::new(Arc::clone(&pool), load, at_capacity);
        Setup { pool, dispatcher }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    impl Setup {
        fn call(&self, method: &str, args: Value) -> crate::runtime::call::CallCompletion {
            let (call, completion) = Call::new(method, args);
            self.dispatcher.dispatch(call);
            completion
        }

        /// Occupy the only worker until the returned call finishes
        async fn saturate(&self, ms: u64) -> crate::runtime::call::CallCompletion {
            let slow = self.call("sleepThenReturn", json!([ms, "slow"]));
            wait_until(|| self.pool.at_capacity_count() == 1).await;
            slow
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_worker() {
        let setup = setup("queue");
        let reply = setup.call("returnResult", json!("foo")).await.unwrap();
        assert_eq!(reply, json!("foo"));
        assert_eq!(setup.pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_at_capacity() {
        let setup = setup("drop");
        let slow = setup.saturate(100).await;
        let worker = setup.pool.workers()[0].clone();
        let received = worker.calls_received();

        let dropped = setup.call("returnResult", json!("foo")).await.unwrap();
        assert_eq!(dropped, Value::Null);
        assert_eq!(worker.calls_received(), received);

        assert_eq!(slow.await.unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn test_error_at_capacity() {
        let setup = setup("error");
        let slow = setup.saturate(100).await;

        let err = setup.call("returnResult", json!("foo")).await.unwrap_err();
        assert!(err.is_at_capacity());
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_beyond_capacity_is_rejected() {
        let setup = setup("error");
        setup.call("returnResult", json!("warm")).await.unwrap();
        wait_until(|| setup.pool.idle_count() == 1).await;

        let burst: Vec<_> = (0..5)
            .map(|i| setup.call("sleepThenReturn", json!([100, i])))
            .collect();
        let replies = futures::future::join_all(burst).await;

        assert_eq!(replies[0].as_ref().unwrap(), &json!(0));
        for reply in &replies[1..] {
            assert!(reply.as_ref().unwrap_err().is_at_capacity());
        }
        assert_eq!(setup.pool.workers()[0].calls_received(), 2);
    }

    #[tokio::test]
    async fn test_queue_waits_for_capacity() {
        let setup = setup("queue");
        let slow = setup.saturate(100).await;

        let queued = tokio::spawn(setup.call("returnResult", json!("foo")));
        wait_until(|| setup.dispatcher.is_paused()).await;
        assert!(!queued.is_finished());
        assert_eq!(setup.dispatcher.queued_calls(), 1);

        slow.await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), queued)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, json!("foo"));
        assert!(!setup.dispatcher.is_paused());
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let setup = setup("queue");
        let slow = setup.saturate(50).await;

        let calls: Vec<_> = (0..5)
            .map(|i| tokio::spawn(setup.call("returnResult", json!(i))))
            .collect();
        slow.await.unwrap();

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let setup = setup("queue");
        let mut events = setup.pool.subscribe();

        let err = setup.call("throwError", Value::Null).await.unwrap_err();
        assert!(matches!(err, PoolError::Remote(_)));

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let PoolEvent::CallFailed { method, .. } = events.recv().await.unwrap() {
                    return method;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed, "throwError");
    }

    #[tokio::test]
    async fn test_no_worker_selected() {
        struct Declines;

        #[async_trait]
        impl LoadStrategy for Declines {
            fn at_capacity(&self) -> bool {
                false
            }

            async fn select_worker(&self) -> Result<Option<Arc<WorkerHandle>>> {
                Ok(None)
            }
        }

        let Setup { pool, .. } = setup("queue");
        let at_capacity = AtCapacityStrategyKind::Queue.build(pool.events().clone());
        let dispatcher = CallDispatcher::new(pool, Arc::new(Declines), at_capacity);

        let (call, completion) = Call::new("returnResult", json!("foo"));
        dispatcher.dispatch(call);
        assert!(matches!(
            completion.await.unwrap_err(),
            PoolError::NoWorkerSelected
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_calls() {
        let setup = setup("queue");
        setup.dispatcher.close();

        let err = setup.call("returnResult", json!("foo")).await.unwrap_err();
        assert!(matches!(err, PoolError::IllegalState(_)));
    }
}
