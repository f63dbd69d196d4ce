// src/runtime/worker_handle.rs
//! Worker handle managing one worker process at a time
//!
//! A handle outlives its processes: a reset kills the current child and
//! forks a new one behind the same id, carrying queued calls across.
//!
//! ```text
//! Created ──fork──► Forking ──init ok──► Processing ◄──► Flushing
//!                      ▲                     │               │
//!                      └──────── Dying ◄─────┴───────────────┘
//!
//! any state ──kill(destroy)──► Destroying (terminal)
//! ```
//!
//! Calls travel through a [`Pipe`] whose capacity is the per-worker
//! concurrency limit and whose pending timeout is the invocation timeout.
//! The pipe is paused whenever no child is connected.

use crate::pipe::{Inbound, MessageId, Outbound, PendingReply, Pipe, PipeConfig};
use crate::protocol::{IfaceReply, Op, PidReply, Request};
use crate::runtime::events::PoolEvent;
use crate::runtime::process_manager::{
    ExitInfo, Launcher, ProcessControl, ProcessLink, TransportEvent,
};
use crate::utils::errors::{PoolError, Result};
use futures::future::{self, BoxFuture, FutureExt};
use metrics::counter;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Request id used for `die`, which bypasses the pipe
const DIE_REQUEST_ID: MessageId = MessageId::MAX;

/// Per-worker options
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Work module loaded by `init`
    pub module_name: String,

    /// Idle time before the worker destroys itself (None = never)
    pub inactivity_timeout: Option<Duration>,

    /// Per-call deadline (None = unbounded)
    pub invocation_timeout: Option<Duration>,

    /// Drain grace period during a reset
    pub flush_timeout: Duration,

    /// Grace period between `die` and SIGKILL
    pub force_kill_timeout: Duration,

    /// Calls in flight on the child at once
    pub max_concurrent_calls: usize,

    /// Calls a child handles before it is recycled
    pub max_total_calls: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            module_name: String::new(),
            inactivity_timeout: None,
            invocation_timeout: Some(Duration::from_secs(30)),
            flush_timeout: Duration::from_secs(5),
            force_kill_timeout: Duration::from_secs(5),
            max_concurrent_calls: 10,
            max_total_calls: None,
        }
    }
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    Created,
    Forking,
    Processing,
    Flushing,
    Dying,
    Destroying,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Forking => "forking",
            WorkerState::Processing => "processing",
            WorkerState::Flushing => "flushing",
            WorkerState::Dying => "dying",
            WorkerState::Destroying => "destroying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Destroying)
    }

    /// Allowed transitions; staying in the same state is always allowed
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;

        if *self == next {
            return true;
        }

        matches!(
            (*self, next),
            (Created, Forking)
                | (Dying, Forking)
                | (Forking, Processing)
                | (Flushing, Processing)
                | (Processing, Flushing)
                | (Forking, Dying)
                | (Processing, Dying)
                | (Flushing, Dying)
                | (Created, Destroying)
                | (Forking, Destroying)
                | (Processing, Destroying)
                | (Flushing, Destroying)
                | (Dying, Destroying)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load on a handle relative to its concurrency limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkingStatus {
    Idle,
    Busy,
    AtCapacity,
}

impl WorkingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingStatus::Idle => "idle",
            WorkingStatus::Busy => "busy",
            WorkingStatus::AtCapacity => "atCapacity",
        }
    }
}

impl fmt::Display for WorkingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters accumulated over the handle's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub forks: u64,
    pub resets: u64,
    pub calls_received: u64,
    pub calls_handled: u64,
    pub errors: u64,
    /// Highest number of calls seen in flight at once
    pub max_concurrent_calls: usize,
}

impl WorkerStats {
    /// Fold another handle's counters into these
    pub fn merge(&mut self, other: &WorkerStats) {
        self.forks += other.forks;
        self.resets += other.resets;
        self.calls_received += other.calls_received;
        self.calls_handled += other.calls_handled;
        self.errors += other.errors;
        self.max_concurrent_calls = self.max_concurrent_calls.max(other.max_concurrent_calls);
    }
}

/// Receives a handle's state and working-status changes
///
/// Called without any handle lock held; implementations read the current
/// values from the handle.
pub trait WorkerObserver: Send + Sync {
    fn worker_state_changed(&self, worker: &Arc<WorkerHandle>, previous: WorkerState);
    fn working_status_changed(&self, worker: &Arc<WorkerHandle>, previous: WorkingStatus);
}

/// Point-in-time view of a handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: u64,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub working_status: WorkingStatus,
    pub pending_calls: usize,
    pub queued_calls: usize,
    pub calls_received: u64,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

/// The connected child
struct Process {
    outbound: mpsc::UnboundedSender<Request>,
    control: Arc<dyn ProcessControl>,
}

struct HandleState {
    state: WorkerState,
    working_status: WorkingStatus,
    pid: Option<u32>,
    process: Option<Process>,
    /// Bumped on every fork; events from older children are ignored
    generation: u64,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    /// Calls received by the current child
    calls_received: u64,
    exit_waiters: Vec<oneshot::Sender<()>>,
    inactivity_timer: Option<JoinHandle<()>>,
    kill_timer: Option<JoinHandle<()>>,
    stats: WorkerStats,
}

/// Handle owning one worker process at a time
pub struct WorkerHandle {
    id: u64,
    config: WorkerConfig,
    launcher: Arc<dyn Launcher>,
    pipe: Pipe<Op, Value>,
    inner: Mutex<HandleState>,
    observer: Option<Weak<dyn WorkerObserver>>,
    events: broadcast::Sender<PoolEvent>,
    resetting: AtomicBool,
    me: Weak<WorkerHandle>,
}

fn ready<T: Send + 'static>(result: Result<T>) -> BoxFuture<'static, Result<T>> {
    future::ready(result).boxed()
}

fn handle_dropped() -> PoolError {
    PoolError::IllegalState("worker handle dropped".to_string())
}

impl WorkerHandle {
    /// Create a handle in the `Created` state; call [`fork`](Self::fork) to start it
    pub fn new(
        id: u64,
        config: WorkerConfig,
        launcher: Arc<dyn Launcher>,
        events: broadcast::Sender<PoolEvent>,
        observer: Option<Weak<dyn WorkerObserver>>,
    ) -> Arc<Self> {
        let pipe = Pipe::new(PipeConfig {
            name: format!("worker-{}", id),
            max_pending: config.max_concurrent_calls,
            pending_timeout: config.invocation_timeout,
            ..Default::default()
        });
        pipe.set_paused(true);

        let handle = Arc::new_cyclic(|me| Self {
            id,
            config,
            launcher,
            pipe,
            inner: Mutex::new(HandleState {
                state: WorkerState::Created,
                working_status: WorkingStatus::Idle,
                pid: None,
                process: None,
                generation: 0,
                exit_code: None,
                exit_signal: None,
                calls_received: 0,
                exit_waiters: Vec::new(),
                inactivity_timer: None,
                kill_timer: None,
                stats: WorkerStats::default(),
            }),
            observer,
            events,
            resetting: AtomicBool::new(false),
            me: me.clone(),
        });

        let weak = Arc::downgrade(&handle);
        handle.pipe.set_sender(move |outbound: Outbound<Op>| match weak.upgrade() {
            Some(worker) => worker.transmit(outbound),
            None => Err(handle_dropped()),
        });

        handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pid of the current (or last) child
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn working_status(&self) -> WorkingStatus {
        self.inner.lock().working_status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    pub fn exit_signal(&self) -> Option<i32> {
        self.inner.lock().exit_signal
    }

    /// Calls received by the current child
    pub fn calls_received(&self) -> u64 {
        self.inner.lock().calls_received
    }

    pub fn stats(&self) -> WorkerStats {
        self.inner.lock().stats.clone()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.pipe.pending()
    }

    pub fn queued_calls(&self) -> usize {
        self.pipe.queued()
    }

    pub fn is_idle(&self) -> bool {
        self.pipe.pending() == 0
    }

    pub fn at_capacity(&self) -> bool {
        self.pipe.at_capacity()
    }

    /// Processing and below its concurrency limit
    pub fn is_available(&self) -> bool {
        self.state() == WorkerState::Processing && !self.at_capacity()
    }

    /// True once the current child has handled its call quota
    pub fn reset_needed(&self) -> bool {
        let calls = self.inner.lock().calls_received;
        self.config.max_total_calls.map_or(false, |max| calls >= max)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let pending_calls = self.pipe.pending();
        let queued_calls = self.pipe.queued();
        let inner = self.inner.lock();
        WorkerSnapshot {
            id: self.id,
            pid: inner.pid,
            state: inner.state,
            working_status: inner.working_status,
            pending_calls,
            queued_calls,
            calls_received: inner.calls_received,
            exit_code: inner.exit_code,
            exit_signal: inner.exit_signal,
        }
    }

    /// Start a child, initialize it and move to `Processing`
    ///
    /// Calls left pending on a previous child are requeued ahead of new work.
    /// If the child cannot be launched or initialized the handle is destroyed.
    pub fn fork(&self) -> BoxFuture<'static, Result<()>> {
        let Some(me) = self.me.upgrade() else {
            return ready(Err(handle_dropped()));
        };

        match self.start_process() {
            Ok(init) => async move { me.finish_fork(init).await }.boxed(),
            Err(e) => ready(Err(e)),
        }
    }

    fn start_process(&self) -> Result<PendingReply<Value>> {
        {
            let inner = self.inner.lock();
            if inner.state == WorkerState::Forking {
                return Err(PoolError::IllegalState(format!(
                    "Worker {} is already forking",
                    self.id
                )));
            }
            if inner.process.is_some() {
                return Err(PoolError::IllegalState(format!(
                    "Worker {} still has a running process",
                    self.id
                )));
            }
        }

        self.set_state(WorkerState::Forking)?;
        self.pipe.set_paused(true);
        self.pipe.reset_pending();

        let generation = {
            let mut inner = self.inner.lock();
            inner.exit_code = None;
            inner.exit_signal = None;
            inner.calls_received = 0;
            inner.generation += 1;
            inner.stats.forks += 1;
            inner.generation
        };
        self.touch();
        counter!("forkpool_worker_forks_total").increment(1);

        let ProcessLink {
            pid,
            outbound,
            events,
            control,
        } = match self.launcher.launch() {
            Ok(link) => link,
            Err(e) => {
                error!("{}: failed to launch worker process: {}", self, e);
                self.record_error();
                if self.set_state(WorkerState::Destroying).is_ok() {
                    self.cancel_inactivity_timer();
                    self.pipe.fail_all(e.clone());
                }
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.pid = Some(pid);
            inner.process = Some(Process { outbound, control });
        }
        tokio::spawn(pump(self.me.clone(), generation, events));

        let _ = self.events.send(PoolEvent::ProcessCreated {
            worker_id: self.id,
            pid,
        });
        debug!("{}: process created", self);

        let init = self.pipe.send_urgent(Op::Init {
            module_name: self.config.module_name.clone(),
        });
        self.pipe.set_paused(false);
        Ok(init)
    }

    async fn finish_fork(self: Arc<Self>, init: PendingReply<Value>) -> Result<()> {
        match init.await {
            Ok(_) => {
                self.set_state(WorkerState::Processing)?;
                info!("{}: ready", self);
                Ok(())
            }
            Err(e) => {
                error!("{}: error initializing worker: {}", self, e);
                self.record_error();
                if self.set_state(WorkerState::Destroying).is_ok() {
                    self.cancel_inactivity_timer();
                    self.signal_process(Signal::SIGKILL);
                    self.pipe.fail_all(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Send a method call to the child
    ///
    /// Counts toward the recycle quota immediately. Once the reply arrives
    /// and the quota is reached, the handle resets itself exactly once.
    pub fn invoke(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value>> {
        let method = method.into();
        let Some(me) = self.me.upgrade() else {
            return ready(Err(handle_dropped()));
        };

        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return ready(Err(PoolError::IllegalState(format!(
                    "Worker {} is destroyed",
                    self.id
                ))));
            }
            inner.calls_received += 1;
            inner.stats.calls_received += 1;
        }
        self.touch();
        counter!("forkpool_calls_total").increment(1);
        trace!("{}: invoking {}", self, method);

        let reply = self.pipe.send(Op::Invoke { method, args });
        self.refresh_working_status();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = reply.await;
            me.handle_invoke_reply(&outcome);
            let _ = tx.send(outcome);
        });

        async move {
            rx.await
                .map_err(|_| PoolError::IllegalState("invocation abandoned".to_string()))?
        }
        .boxed()
    }

    fn handle_invoke_reply(&self, outcome: &Result<Value>) {
        let reset_needed = {
            let mut inner = self.inner.lock();
            inner.stats.calls_handled += 1;
            if matches!(outcome, Err(PoolError::Timeout(_)) | Err(PoolError::Transport(_))) {
                inner.stats.errors += 1;
            }
            inner.state == WorkerState::Processing
                && self
                    .config
                    .max_total_calls
                    .map_or(false, |max| inner.calls_received >= max)
        };

        if reset_needed && !self.resetting.load(Ordering::SeqCst) {
            debug!("{}: call quota reached, recycling", self);
            self.spawn_reset(false);
        }
        self.refresh_working_status();
    }

    /// List the work module's exported methods
    pub fn discover_interface(&self) -> BoxFuture<'static, Result<Vec<String>>> {
        let reply = self.settled(self.pipe.send(Op::Iface {}));
        async move {
            let reply: IfaceReply = serde_json::from_value(reply.await?)?;
            Ok(reply.iface)
        }
        .boxed()
    }

    /// Round-trip to the child, returning its pid
    pub fn ping(&self) -> BoxFuture<'static, Result<u32>> {
        let reply = self.settled(self.pipe.send(Op::Ping {}));
        async move {
            let reply: PidReply = serde_json::from_value(reply.await?)?;
            Ok(reply.pid)
        }
        .boxed()
    }

    /// Recompute the working status once a control reply settles, including
    /// by timeout or failure
    fn settled(&self, reply: PendingReply<Value>) -> BoxFuture<'static, Result<Value>> {
        let me = self.me.clone();
        self.refresh_working_status();
        async move {
            let outcome = reply.await;
            if let Some(worker) = me.upgrade() {
                worker.refresh_working_status();
            }
            outcome
        }
        .boxed()
    }

    /// Wait for queued and pending calls to finish
    ///
    /// With `emit`, the handle moves to `Flushing` and back to `Processing`.
    /// New calls fail while the flush is outstanding.
    pub fn flush(&self, emit: bool) -> BoxFuture<'static, Result<()>> {
        if emit {
            if let Err(e) = self.set_state(WorkerState::Flushing) {
                return ready(Err(e));
            }
        }

        let flushed = self.pipe.flush();
        let me = self.me.clone();
        async move {
            flushed.await?;
            if emit {
                if let Some(worker) = me.upgrade() {
                    if worker.state() == WorkerState::Flushing {
                        worker.set_state(WorkerState::Processing)?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Stop the current child
    ///
    /// Without `force`, the child is asked to exit and SIGKILLed after
    /// `force_kill_timeout`. With `destroy`, the handle becomes unusable and
    /// its outstanding calls fail. Resolves once the child has exited.
    pub fn kill(&self, force: bool, destroy: bool) -> BoxFuture<'static, Result<()>> {
        let target = if destroy {
            WorkerState::Destroying
        } else {
            WorkerState::Dying
        };
        if let Err(e) = self.set_state(target) {
            return ready(Err(e));
        }
        if destroy {
            self.cancel_inactivity_timer();
        }

        let running = {
            let mut inner = self.inner.lock();
            let running = inner
                .process
                .as_ref()
                .map(|p| (p.outbound.clone(), Arc::clone(&p.control)));
            running.map(|(outbound, control)| {
                let (tx, rx) = oneshot::channel();
                inner.exit_waiters.push(tx);
                (outbound, control, rx)
            })
        };

        let Some((outbound, control, exited)) = running else {
            if destroy {
                self.discard_calls();
            }
            return ready(Ok(()));
        };

        if force {
            debug!("{}: force killing", self);
            if let Err(e) = control.signal(Signal::SIGKILL) {
                warn!("{}: {}", self, e);
            }
        } else {
            debug!("{}: gracefully killing", self);
            let die = Request {
                id: DIE_REQUEST_ID,
                message: Op::Die {},
            };
            if outbound.send(die).is_err() {
                let _ = control.signal(Signal::SIGKILL);
            } else {
                let grace = self.config.force_kill_timeout;
                let worker_id = self.id;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    debug!(
                        "Worker {}: still alive after {}ms, force killing",
                        worker_id,
                        grace.as_millis()
                    );
                    if let Err(e) = control.signal(Signal::SIGKILL) {
                        warn!("Worker {}: {}", worker_id, e);
                    }
                });
                if let Some(previous) = self.inner.lock().kill_timer.replace(timer) {
                    previous.abort();
                }
            }
        }

        let me = self.me.clone();
        async move {
            let _ = exited.await;
            if destroy {
                if let Some(worker) = me.upgrade() {
                    worker.discard_calls();
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Flush, kill and fork a fresh child behind the same handle
    ///
    /// The flush is bounded by `flush_timeout`; calls still pending when it
    /// expires are discarded. A reset requested while one is running is a
    /// no-op.
    pub fn reset(&self, hard: bool) -> BoxFuture<'static, Result<()>> {
        let Some(me) = self.me.upgrade() else {
            return ready(Err(handle_dropped()));
        };

        if self.resetting.swap(true, Ordering::SeqCst) {
            debug!("{}: reset already in progress", self);
            return ready(Ok(()));
        }

        debug!("{}: reset", self);
        if let Err(e) = self.set_state(WorkerState::Flushing) {
            self.resetting.store(false, Ordering::SeqCst);
            return ready(Err(e));
        }
        self.inner.lock().stats.resets += 1;
        counter!("forkpool_worker_resets_total").increment(1);

        let flushed = self.pipe.flush();
        async move {
            let result = me.finish_reset(flushed, hard).await;
            me.resetting.store(false, Ordering::SeqCst);
            result
        }
        .boxed()
    }

    async fn finish_reset(
        &self,
        flushed: impl Future<Output = Result<()>>,
        hard: bool,
    ) -> Result<()> {
        if tokio::time::timeout(self.config.flush_timeout, flushed)
            .await
            .is_err()
        {
            warn!(
                "{}: flush timed out after {}ms",
                self,
                self.config.flush_timeout.as_millis()
            );
            self.pipe.abandon_flush();
        }

        self.kill(hard, false).await?;
        self.pipe.clear_pending();
        self.fork().await
    }

    fn spawn_reset(&self, hard: bool) {
        let reset = self.reset(hard);
        let worker_id = self.id;
        tokio::spawn(async move {
            if let Err(e) = reset.await {
                warn!("Worker {}: reset failed: {}", worker_id, e);
            }
        });
    }

    fn transmit(&self, outbound: Outbound<Op>) -> Result<()> {
        let channel = self
            .inner
            .lock()
            .process
            .as_ref()
            .map(|p| p.outbound.clone());

        let channel = channel
            .ok_or_else(|| PoolError::Transport(format!("Worker {} has no process", self.id)))?;

        trace!("Worker {}: sending {} ({})", self.id, outbound.id, outbound.payload.name());
        channel
            .send(Request {
                id: outbound.id,
                message: outbound.payload,
            })
            .map_err(|_| PoolError::Transport(format!("Worker {} channel closed", self.id)))
    }

    fn set_state(&self, next: WorkerState) -> Result<WorkerState> {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if !previous.can_transition_to(next) {
                return Err(PoolError::IllegalState(format!(
                    "Worker {} cannot move from {} to {}",
                    self.id, previous, next
                )));
            }
            inner.state = next;
            previous
        };

        if previous != next {
            debug!("{}: state changed from {}", self, previous);
            self.notify(|observer, me| observer.worker_state_changed(me, previous));
            self.refresh_working_status();
        }
        Ok(previous)
    }

    /// Recompute the working status from the pipe's load
    fn refresh_working_status(&self) {
        let pending = self.pipe.pending();
        let queued = self.pipe.queued();
        let status = if self.pipe.at_capacity() {
            WorkingStatus::AtCapacity
        } else if pending == 0 && queued == 0 {
            WorkingStatus::Idle
        } else {
            WorkingStatus::Busy
        };

        let previous = {
            let mut inner = self.inner.lock();
            inner.stats.max_concurrent_calls = inner.stats.max_concurrent_calls.max(pending);
            std::mem::replace(&mut inner.working_status, status)
        };

        if previous != status {
            trace!("{}: working status changed from {}", self, previous);
            self.notify(|observer, me| observer.working_status_changed(me, previous));
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn WorkerObserver, &Arc<WorkerHandle>)) {
        let observer = self.observer.as_ref().and_then(Weak::upgrade);
        if let (Some(observer), Some(me)) = (observer, self.me.upgrade()) {
            f(observer.as_ref(), &me);
        }
    }

    fn record_error(&self) {
        self.inner.lock().stats.errors += 1;
        counter!("forkpool_worker_errors_total").increment(1);
    }

    fn signal_process(&self, signal: Signal) {
        let control = self
            .inner
            .lock()
            .process
            .as_ref()
            .map(|p| Arc::clone(&p.control));
        if let Some(control) = control {
            if let Err(e) = control.signal(signal) {
                warn!("Worker {}: {}", self.id, e);
            }
        }
    }

    fn discard_calls(&self) {
        self.pipe.fail_all(PoolError::IllegalState(format!(
            "Worker {} was destroyed",
            self.id
        )));
        self.refresh_working_status();
    }

    /// Restart the inactivity timer
    fn touch(&self) {
        let Some(timeout) = self.config.inactivity_timeout else {
            return;
        };

        let weak = self.me.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(worker) = weak.upgrade() {
                worker.inactivity_expired();
            }
        });

        if let Some(previous) = self.inner.lock().inactivity_timer.replace(timer) {
            previous.abort();
        }
    }

    fn cancel_inactivity_timer(&self) {
        if let Some(timer) = self.inner.lock().inactivity_timer.take() {
            timer.abort();
        }
    }

    fn inactivity_expired(&self) {
        // Runs on the timer task itself; detach rather than abort it
        self.inner.lock().inactivity_timer.take();
        if self.state().is_terminal() {
            return;
        }

        debug!("{}: inactivity timed out", self);
        let _ = self.events.send(PoolEvent::InactivityTimeout { worker_id: self.id });

        let kill = self.kill(false, true);
        let worker_id = self.id;
        tokio::spawn(async move {
            if let Err(e) = kill.await {
                warn!("Worker {}: inactivity kill failed: {}", worker_id, e);
            }
        });
    }

    fn on_transport_error(&self, generation: u64, err: PoolError) {
        if self.inner.lock().generation != generation {
            return;
        }

        warn!("{}: transport error: {}", self, err);
        self.record_error();
        if self.state() == WorkerState::Processing {
            self.spawn_reset(false);
        }
    }

    fn on_exit(&self, generation: u64, info: ExitInfo) {
        let (state, waiters, pid) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.process.is_none() {
                return;
            }
            inner.process = None;
            inner.exit_code = info.code;
            inner.exit_signal = info.signal;
            if let Some(timer) = inner.kill_timer.take() {
                timer.abort();
            }
            (
                inner.state,
                std::mem::take(&mut inner.exit_waiters),
                inner.pid,
            )
        };

        self.pipe.set_paused(true);
        let _ = self.events.send(PoolEvent::ProcessExited {
            worker_id: self.id,
            pid,
            code: info.code,
            signal: info.signal,
        });
        debug!(
            "{}: process exited (code {:?}, signal {:?})",
            self, info.code, info.signal
        );

        for waiter in waiters {
            let _ = waiter.send(());
        }

        match state {
            WorkerState::Forking | WorkerState::Processing | WorkerState::Flushing => {
                let error = PoolError::Transport(format!(
                    "worker process {} exited unexpectedly (code {:?}, signal {:?})",
                    pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                    info.code,
                    info.signal
                ));
                warn!("{}: {}", self, error);
                self.record_error();
                self.pipe.fail_pending(error);
                self.refresh_working_status();

                // A failed init destroys the handle; a running reset re-forks itself
                if state == WorkerState::Forking || self.resetting.load(Ordering::SeqCst) {
                    return;
                }

                if state == WorkerState::Flushing {
                    self.pipe.abandon_flush();
                }
                if self.set_state(WorkerState::Dying).is_ok() {
                    let fork = self.fork();
                    let worker_id = self.id;
                    tokio::spawn(async move {
                        if let Err(e) = fork.await {
                            warn!("Worker {}: re-fork failed: {}", worker_id, e);
                        }
                    });
                }
            }
            WorkerState::Created | WorkerState::Dying | WorkerState::Destroying => {}
        }
    }
}

/// Feed one child's events into its handle
async fn pump(
    worker: Weak<WorkerHandle>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(handle) = worker.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Reply(response) => {
                let id = response.id;
                handle.pipe.receive(Inbound {
                    id,
                    outcome: response.into_outcome(),
                });
                handle.refresh_working_status();
            }
            TransportEvent::Error(err) => handle.on_transport_error(generation, err),
            TransportEvent::Exited(info) => {
                handle.on_exit(generation, info);
                return;
            }
        }
    }

    // Launcher went away without reporting an exit
    if let Some(handle) = worker.upgrade() {
        handle.on_exit(generation, ExitInfo::default());
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        write!(
            f,
            "Worker[id={}, pid={}, workingStatus={}, state={}, pendingCalls={}, queuedCalls={}]",
            snapshot.id,
            snapshot
                .pid
                .map_or_else(|| "null".to_string(), |p| p.to_string()),
            snapshot.working_status,
            snapshot.state,
            snapshot.pending_calls,
            snapshot.queued_calls
        )
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(timer) = inner.inactivity_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.kill_timer.take() {
            timer.abort();
        }
        // Best-effort cleanup
        if let Some(process) = inner.process.take() {
            debug!("Worker {}: killing process on drop", self.id);
            let _ = process.control.signal(Signal::SIGKILL);
        }
    }
}
