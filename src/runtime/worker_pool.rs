// src/runtime/worker_pool.rs
//! Worker pool indexed by availability
//!
//! The pool owns every live [`WorkerHandle`] and keeps three derived
//! indices, updated from the handles' own change notifications:
//!
//! ```text
//! WorkerPool
//! ├─ idle:        Processing, nothing in flight
//! ├─ busy:        Processing, below its concurrency limit
//! └─ at_capacity: Processing, concurrency limit reached
//! ```
//!
//! A handle outside `Processing` is in no index. A handle that reaches
//! `Destroying` leaves the pool for good and its counters are folded into
//! the retired totals.
//!
//! `PoolAvailable` is published when `idle + busy` goes from zero to one,
//! `PoolUnavailable` when it drops back to zero.

use crate::runtime::events::PoolEvent;
use crate::runtime::process_manager::Launcher;
use crate::runtime::worker_handle::{
    WorkerConfig, WorkerHandle, WorkerObserver, WorkerSnapshot, WorkerState, WorkerStats,
    WorkingStatus,
};
use crate::utils::errors::{PoolError, Result};
use futures::future::join_all;
use indexmap::IndexMap;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Aggregated pool counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub at_capacity: usize,
    /// Live and retired handles combined
    pub totals: WorkerStats,
    pub worker_snapshots: Vec<WorkerSnapshot>,
}

type Index = IndexMap<u64, Arc<WorkerHandle>>;

#[derive(Default)]
struct PoolIndex {
    next_id: u64,
    closed: bool,
    workers: Index,
    idle: Index,
    busy: Index,
    at_capacity: Index,
    retired: WorkerStats,
}

impl PoolIndex {
    fn available(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn first_available(&self) -> Option<Arc<WorkerHandle>> {
        self.idle
            .values()
            .next()
            .or_else(|| self.busy.values().next())
            .cloned()
    }

    fn unindex(&mut self, id: u64) {
        self.idle.shift_remove(&id);
        self.busy.shift_remove(&id);
        self.at_capacity.shift_remove(&id);
    }
}

/// Collection of worker handles sharing one launcher and configuration
pub struct WorkerPool {
    config: WorkerConfig,
    launcher: Arc<dyn Launcher>,
    events: broadcast::Sender<PoolEvent>,
    inner: Mutex<PoolIndex>,
    me: Weak<WorkerPool>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        launcher: Arc<dyn Launcher>,
        events: broadcast::Sender<PoolEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            launcher,
            events,
            inner: Mutex::new(PoolIndex {
                next_id: 1,
                ..Default::default()
            }),
            me: me.clone(),
        })
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<PoolEvent> {
        &self.events
    }

    /// Add a worker and start forking it
    ///
    /// The handle accepts calls immediately; they are delivered once the
    /// child is initialized.
    pub fn add_worker(&self) -> Result<Arc<WorkerHandle>> {
        self.insert_worker(None)?
            .ok_or_else(|| PoolError::IllegalState("worker pool is shut down".to_string()))
    }

    /// Add a worker only while the pool holds fewer than `limit` handles
    pub fn try_add_worker(&self, limit: usize) -> Result<Option<Arc<WorkerHandle>>> {
        self.insert_worker(Some(limit))
    }

    fn insert_worker(&self, limit: Option<usize>) -> Result<Option<Arc<WorkerHandle>>> {
        let observer: Weak<dyn WorkerObserver> = self.me.clone();

        let (worker, count) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PoolError::IllegalState(
                    "worker pool is shut down".to_string(),
                ));
            }
            if limit.map_or(false, |limit| inner.workers.len() >= limit) {
                return Ok(None);
            }

            let id = inner.next_id;
            inner.next_id += 1;
            let worker = WorkerHandle::new(
                id,
                self.config.clone(),
                Arc::clone(&self.launcher),
                self.events.clone(),
                Some(observer),
            );
            inner.workers.insert(id, Arc::clone(&worker));
            (worker, inner.workers.len())
        };

        gauge!("forkpool_workers").set(count as f64);
        let _ = self.events.send(PoolEvent::WorkerAdded {
            worker_id: worker.id(),
        });
        debug!("Added worker {} ({} in pool)", worker.id(), count);

        let fork = worker.fork();
        let worker_id = worker.id();
        tokio::spawn(async move {
            if let Err(e) = fork.await {
                warn!("Worker {}: fork failed: {}", worker_id, e);
            }
        });

        Ok(Some(worker))
    }

    /// Destroy one worker: the given handle, or else an idle, busy or any handle
    ///
    /// Resolves with the removed worker's id once its process has exited.
    pub async fn remove_worker(
        &self,
        worker: Option<Arc<WorkerHandle>>,
        force: bool,
    ) -> Result<Option<u64>> {
        let worker = match worker {
            Some(worker) => Some(worker),
            None => self.removal_candidates(1).into_iter().next(),
        };

        let Some(worker) = worker else {
            return Ok(None);
        };

        debug!("Removing worker {} (force: {})", worker.id(), force);
        worker.kill(force, true).await?;
        Ok(Some(worker.id()))
    }

    /// Grow the pool to at least `count` workers, returning the added handles
    pub fn ensure_minimum_workers(&self, count: usize) -> Result<Vec<Arc<WorkerHandle>>> {
        let mut added = Vec::new();
        while let Some(worker) = self.try_add_worker(count)? {
            added.push(worker);
        }
        Ok(added)
    }

    /// Shrink the pool to at most `count` workers, idle ones first
    pub async fn ensure_maximum_workers(&self, count: usize, force: bool) -> Result<()> {
        let excess = self.worker_count().saturating_sub(count);
        if excess == 0 {
            return Ok(());
        }

        debug!("Shrinking pool by {} workers", excess);
        let kills = self
            .removal_candidates(excess)
            .into_iter()
            .map(|worker| worker.kill(force, true));

        join_all(kills).await.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Destroy every worker and refuse new ones
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        let workers: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.workers.values().cloned().collect()
        };

        info!("Shutting down {} workers (force: {})", workers.len(), force);
        let results = join_all(workers.iter().map(|worker| worker.kill(force, true))).await;

        let mut first_error = None;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Worker {}: shutdown failed: {}", worker.id(), e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn removal_candidates(&self, count: usize) -> Vec<Arc<WorkerHandle>> {
        let inner = self.inner.lock();
        let mut candidates: Vec<Arc<WorkerHandle>> = Vec::with_capacity(count);

        for worker in inner
            .idle
            .values()
            .chain(inner.busy.values())
            .chain(inner.workers.values())
        {
            if candidates.len() == count {
                break;
            }
            if !candidates.iter().any(|c| c.id() == worker.id()) {
                candidates.push(Arc::clone(worker));
            }
        }

        candidates
    }

    /// An idle worker, else a busy one below its limit
    pub fn available_worker(&self) -> Option<Arc<WorkerHandle>> {
        self.inner.lock().first_available()
    }

    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.lock().workers.values().cloned().collect()
    }

    pub fn idle_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.lock().idle.values().cloned().collect()
    }

    pub fn busy_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.lock().busy.values().cloned().collect()
    }

    pub fn at_capacity_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.lock().at_capacity.values().cloned().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.inner.lock().busy.len()
    }

    pub fn at_capacity_count(&self) -> usize {
        self.inner.lock().at_capacity.len()
    }

    /// Workers that can take a call right now
    pub fn available_count(&self) -> usize {
        self.inner.lock().available()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let (workers, idle, busy, at_capacity, mut totals) = {
            let inner = self.inner.lock();
            (
                inner.workers.values().cloned().collect::<Vec<_>>(),
                inner.idle.len(),
                inner.busy.len(),
                inner.at_capacity.len(),
                inner.retired.clone(),
            )
        };

        let mut worker_snapshots = Vec::with_capacity(workers.len());
        for worker in &workers {
            totals.merge(&worker.stats());
            worker_snapshots.push(worker.snapshot());
        }

        PoolStats {
            workers: workers.len(),
            idle,
            busy,
            at_capacity,
            totals,
            worker_snapshots,
        }
    }

    /// Move a handle to the index matching its current state and load
    fn reindex(&self, worker: &Arc<WorkerHandle>) {
        let id = worker.id();
        let (before, after, available) = {
            let mut inner = self.inner.lock();
            if !inner.workers.contains_key(&id) {
                return;
            }

            let before = inner.available();
            inner.unindex(id);
            if worker.state() == WorkerState::Processing {
                let index = match worker.working_status() {
                    WorkingStatus::Idle => &mut inner.idle,
                    WorkingStatus::Busy => &mut inner.busy,
                    WorkingStatus::AtCapacity => &mut inner.at_capacity,
                };
                index.insert(id, Arc::clone(worker));
            }
            (before, inner.available(), inner.first_available())
        };

        if before == 0 && after > 0 {
            if let Some(available) = available {
                debug!("Pool available (worker {})", available.id());
                let _ = self.events.send(PoolEvent::PoolAvailable(available));
            }
        } else if before > 0 && after == 0 {
            debug!("Pool unavailable");
            let _ = self.events.send(PoolEvent::PoolUnavailable);
        }
    }

    fn retire(&self, worker: &Arc<WorkerHandle>) {
        let id = worker.id();
        let (removed, before, after, count) = {
            let mut inner = self.inner.lock();
            let before = inner.available();
            inner.unindex(id);
            let removed = inner.workers.shift_remove(&id).is_some();
            if removed {
                inner.retired.merge(&worker.stats());
            }
            (removed, before, inner.available(), inner.workers.len())
        };

        if !removed {
            return;
        }

        gauge!("forkpool_workers").set(count as f64);
        let _ = self.events.send(PoolEvent::WorkerRemoved { worker_id: id });
        debug!("Removed worker {} ({} in pool)", id, count);

        if before > 0 && after == 0 {
            let _ = self.events.send(PoolEvent::PoolUnavailable);
        }
    }
}

impl WorkerObserver for WorkerPool {
    fn worker_state_changed(&self, worker: &Arc<WorkerHandle>, _previous: WorkerState) {
        if worker.state() == WorkerState::Destroying {
            self.retire(worker);
        } else {
            self.reindex(worker);
        }
    }

    fn working_status_changed(&self, worker: &Arc<WorkerHandle>, _previous: WorkingStatus) {
        self.reindex(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::in_process::InProcessLauncher;
    use crate::worker::demo;
    use serde_json::json;
    use std::time::Duration;

    fn create_pool(max_concurrent_calls: usize) -> Arc<WorkerPool> {
        let (events, _) = broadcast::channel(256);
        let config = WorkerConfig {
            module_name: demo::MODULE_NAME.to_string(),
            max_concurrent_calls,
            ..Default::default()
        };
        WorkerPool::new(config, Arc::new(InProcessLauncher::new(demo::registry())), events)
    }

    async fn next_event(
        events: &mut broadcast::Receiver<PoolEvent>,
        mut matches: impl FnMut(&PoolEvent) -> bool,
    ) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_worker_becomes_idle() {
        let pool = create_pool(10);
        let mut events = pool.subscribe();

        let worker = pool.add_worker().unwrap();
        assert_eq!(pool.worker_count(), 1);
        assert!(pool.available_worker().is_none());

        match next_event(&mut events, |e| matches!(e, PoolEvent::PoolAvailable(_))).await {
            PoolEvent::PoolAvailable(available) => assert_eq!(available.id(), worker.id()),
            _ => unreachable!(),
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.available_worker().unwrap().id(), worker.id());
    }

    #[tokio::test]
    async fn test_available_worker_prefers_idle() {
        let pool = create_pool(10);
        let first = pool.add_worker().unwrap();
        let second = pool.add_worker().unwrap();
        first.ping().await.unwrap();
        second.ping().await.unwrap();

        let slow = first.invoke("sleepThenReturn", vec![json!(100), json!("x")]);
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.available_worker().unwrap().id(), second.id());

        slow.await.unwrap();
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_at_capacity_index_and_unavailable() {
        let pool = create_pool(1);
        let mut events = pool.subscribe();
        let worker = pool.add_worker().unwrap();
        worker.ping().await.unwrap();

        let slow = worker.invoke("sleepThenReturn", vec![json!(50), json!("x")]);
        assert_eq!(pool.at_capacity_count(), 1);
        assert_eq!(pool.available_count(), 0);
        assert!(pool.available_worker().is_none());
        next_event(&mut events, |e| matches!(e, PoolEvent::PoolUnavailable)).await;

        slow.await.unwrap();
        next_event(&mut events, |e| matches!(e, PoolEvent::PoolAvailable(_))).await;
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_try_add_worker_respects_limit() {
        let pool = create_pool(10);
        assert!(pool.try_add_worker(2).unwrap().is_some());
        assert!(pool.try_add_worker(2).unwrap().is_some());
        assert!(pool.try_add_worker(2).unwrap().is_none());
        assert_eq!(pool.worker_count(), 2);

        assert!(pool.ensure_minimum_workers(3).unwrap().len() == 1);
        assert_eq!(pool.worker_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_worker_prefers_idle() {
        let pool = create_pool(10);
        let mut events = pool.subscribe();
        let busy = pool.add_worker().unwrap();
        let idle = pool.add_worker().unwrap();
        busy.ping().await.unwrap();
        idle.ping().await.unwrap();

        let slow = busy.invoke("sleepThenReturn", vec![json!(100), json!("x")]);
        let removed = pool.remove_worker(None, false).await.unwrap();
        assert_eq!(removed, Some(idle.id()));
        assert_eq!(idle.state(), WorkerState::Destroying);
        assert_eq!(pool.worker_count(), 1);
        next_event(&mut events, |e| matches!(e, PoolEvent::WorkerRemoved { .. })).await;

        slow.await.unwrap();
        assert_eq!(pool.stats().totals.forks, 2);
    }

    #[tokio::test]
    async fn test_ensure_maximum_workers_shrinks() {
        let pool = create_pool(10);
        for worker in pool.ensure_minimum_workers(4).unwrap() {
            worker.ping().await.unwrap();
        }

        pool.ensure_maximum_workers(1, true).await.unwrap();
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let pool = create_pool(10);
        let worker = pool.add_worker().unwrap();
        worker.ping().await.unwrap();
        worker.invoke("returnResult", vec![json!(1)]).await.unwrap();

        pool.shutdown(false).await.unwrap();
        assert_eq!(pool.worker_count(), 0);
        assert!(pool.is_closed());
        assert!(pool.add_worker().is_err());

        let stats = pool.stats();
        assert_eq!(stats.workers, 0);
        assert_eq!(stats.totals.calls_received, 1);
        assert_eq!(worker.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_inactive_worker_leaves_pool() {
        let (events, _) = broadcast::channel(64);
        let config = WorkerConfig {
            module_name: demo::MODULE_NAME.to_string(),
            inactivity_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let pool = WorkerPool::new(config, Arc::new(InProcessLauncher::new(demo::registry())), events);
        let mut events = pool.subscribe();

        let worker = pool.add_worker().unwrap();
        next_event(&mut events, |e| matches!(e, PoolEvent::InactivityTimeout { .. })).await;
        next_event(&mut events, |e| matches!(e, PoolEvent::WorkerRemoved { .. })).await;
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(worker.state(), WorkerState::Destroying);
    }
}
