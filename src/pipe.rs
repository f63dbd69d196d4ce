// src/pipe.rs
//! Request/reply correlation over an unreliable transport
//!
//! A `Pipe` accepts payloads, transmits them through a registered sender and
//! settles each caller's future when a reply with the matching id comes back
//! through the receiver.
//!
//! ```text
//! send() ──► queue (FIFO) ──[pending < max_pending, !paused]──► pending ──► sender
//!                ▲                                                 │
//!                └──── send failure / reset_pending (new id) ──────┘
//!                                                                  │
//!                     receiver({id, outcome}) ◄── reply ───────────┘
//! ```
//!
//! Replies are matched by id, never by arrival order. A message that is
//! retried or requeued gets a fresh id, so a late reply carrying the old id
//! is dropped instead of settling the wrong caller.

use crate::utils::errors::{PoolError, Result};
use futures::future::{FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Message identifier, unique among queued and pending messages
pub type MessageId = u64;

/// Pipe configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Label used in log lines
    pub name: String,

    /// Maximum number of transmitted messages awaiting a reply
    pub max_pending: usize,

    /// Deadline for a reply once a message is transmitted (None = unbounded)
    pub pending_timeout: Option<Duration>,

    /// Failed transmissions tolerated before the caller is rejected
    pub max_retries: u32,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            name: "pipe".to_string(),
            max_pending: usize::MAX,
            pending_timeout: None,
            max_retries: 3,
        }
    }
}

/// A message handed to the sender
#[derive(Debug, Clone)]
pub struct Outbound<T> {
    pub id: MessageId,
    pub payload: T,
}

/// A reply fed to the receiver
#[derive(Debug)]
pub struct Inbound<R> {
    pub id: MessageId,
    pub outcome: Result<R>,
}

impl<R> Inbound<R> {
    pub fn reply(id: MessageId, message: R) -> Self {
        Self {
            id,
            outcome: Ok(message),
        }
    }

    pub fn error(id: MessageId, error: PoolError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

type SenderFn<T> = Arc<dyn Fn(Outbound<T>) -> Result<()> + Send + Sync>;
type FlushWait = Shared<oneshot::Receiver<()>>;

struct Message<T, R> {
    id: MessageId,
    payload: T,
    completion: oneshot::Sender<Result<R>>,
    /// Failed transmission attempts
    tries: u32,
    timer: Option<JoinHandle<()>>,
}

impl<T, R> Message<T, R> {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct PipeState<T, R> {
    next_id: MessageId,
    queue: VecDeque<Message<T, R>>,
    pending: IndexMap<MessageId, Message<T, R>>,
    flush: Option<(oneshot::Sender<()>, FlushWait)>,
    paused: bool,
    draining: bool,
    sender: Option<SenderFn<T>>,
}

impl<T, R> PipeState<T, R> {
    fn allocate_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_flush_if_drained(&mut self) -> Option<oneshot::Sender<()>> {
        if self.queue.is_empty() && self.pending.is_empty() {
            self.flush.take().map(|(tx, _)| tx)
        } else {
            None
        }
    }
}

struct PipeInner<T, R> {
    config: PipeConfig,
    state: Mutex<PipeState<T, R>>,
}

/// Future for the reply to a single `send`
pub struct PendingReply<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Future for PendingReply<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::IllegalState(
                "message discarded before a reply arrived".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Request/reply correlation pipe
pub struct Pipe<T, R> {
    inner: Arc<PipeInner<T, R>>,
}

impl<T, R> Clone for Pipe<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> fmt::Debug for Pipe<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pipe")
            .field("name", &self.inner.config.name)
            .field("queued", &state.queue.len())
            .field("pending", &state.pending.len())
            .field("paused", &state.paused)
            .field("flushing", &state.flush.is_some())
            .finish()
    }
}

impl<T, R> Pipe<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Create a pipe without a sender; messages queue until one is set
    pub fn new(config: PipeConfig) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                config,
                state: Mutex::new(PipeState {
                    next_id: 0,
                    queue: VecDeque::new(),
                    pending: IndexMap::new(),
                    flush: None,
                    paused: false,
                    draining: false,
                    sender: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PipeConfig {
        &self.inner.config
    }

    /// Register the outbound transport
    ///
    /// The sender may call back into the pipe (including `receive`) before
    /// returning.
    pub fn set_sender<F>(&self, sender: F)
    where
        F: Fn(Outbound<T>) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.state.lock().sender = Some(Arc::new(sender));
        self.process_queue();
    }

    /// Callback feeding replies into this pipe
    pub fn receiver(&self) -> impl Fn(Inbound<R>) + Send + Sync + Clone + 'static {
        let pipe = self.clone();
        move |inbound| pipe.receive(inbound)
    }

    /// Queue a payload for transmission
    pub fn send(&self, payload: T) -> PendingReply<R> {
        self.enqueue(payload, false)
    }

    /// Queue a payload ahead of everything already queued
    pub fn send_urgent(&self, payload: T) -> PendingReply<R> {
        self.enqueue(payload, true)
    }

    fn enqueue(&self, payload: T, urgent: bool) -> PendingReply<R> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.flush.is_some() {
                let _ = tx.send(Err(PoolError::IllegalState(format!(
                    "{} is flushing",
                    self.inner.config.name
                ))));
                return PendingReply { rx };
            }

            let id = state.allocate_id();
            trace!("{}: queueing message {}", self.inner.config.name, id);
            let message = Message {
                id,
                payload,
                completion: tx,
                tries: 0,
                timer: None,
            };
            if urgent {
                state.queue.push_front(message);
            } else {
                state.queue.push_back(message);
            }
        }

        self.process_queue();
        PendingReply { rx }
    }

    /// Settle the pending message matching `inbound.id`
    ///
    /// Replies for unknown ids (expired, reset or discarded messages) are
    /// dropped.
    pub fn receive(&self, inbound: Inbound<R>) {
        let message = self.inner.state.lock().pending.shift_remove(&inbound.id);

        match message {
            Some(mut message) => {
                trace!("{}: reply for message {}", self.inner.config.name, inbound.id);
                message.stop_timer();
                let _ = message.completion.send(inbound.outcome);
            }
            None => {
                debug!(
                    "{}: ignoring reply for unknown message id {}",
                    self.inner.config.name, inbound.id
                );
            }
        }

        self.try_resolve_flush();
        self.process_queue();
    }

    /// Transmit queued messages while capacity allows
    fn process_queue(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let (sender, outbound) = {
                let mut state = self.inner.state.lock();
                let blocked = state.paused
                    || state.queue.is_empty()
                    || state.pending.len() >= self.inner.config.max_pending
                    || state.sender.is_none();
                if blocked {
                    state.draining = false;
                    return;
                }

                let (Some(sender), Some(mut message)) = (state.sender.clone(), state.queue.pop_front())
                else {
                    state.draining = false;
                    return;
                };

                message.timer = self.start_timer(message.id);
                let outbound = Outbound {
                    id: message.id,
                    payload: message.payload.clone(),
                };
                state.pending.insert(message.id, message);
                (sender, outbound)
            };

            let id = outbound.id;
            trace!("{}: sending message {}", self.inner.config.name, id);
            if let Err(err) = sender(outbound) {
                self.handle_send_failure(id, err);
            }
        }
    }

    fn handle_send_failure(&self, id: MessageId, err: PoolError) {
        let rejected = {
            let mut state = self.inner.state.lock();
            let Some(mut message) = state.pending.shift_remove(&id) else {
                return;
            };
            message.stop_timer();
            message.tries += 1;

            if message.tries > self.inner.config.max_retries {
                Some((message, err))
            } else {
                let new_id = state.allocate_id();
                debug!(
                    "{}: send of message {} failed ({}), retrying as {}",
                    self.inner.config.name, id, err, new_id
                );
                message.id = new_id;
                state.queue.push_front(message);
                None
            }
        };

        if let Some((message, err)) = rejected {
            warn!(
                "{}: giving up on message {} after {} failed sends: {}",
                self.inner.config.name, id, message.tries, err
            );
            let _ = message.completion.send(Err(err));
            self.try_resolve_flush();
        }
    }

    fn start_timer(&self, id: MessageId) -> Option<JoinHandle<()>> {
        let timeout = self.inner.config.pending_timeout?;
        let weak: Weak<PipeInner<T, R>> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Pipe { inner }.expire(id, timeout);
            }
        }))
    }

    fn expire(&self, id: MessageId, timeout: Duration) {
        let message = self.inner.state.lock().pending.shift_remove(&id);
        let Some(mut message) = message else {
            return;
        };

        // The timer task is the one running this code
        message.timer.take();
        debug!("{}: message {} timed out", self.inner.config.name, id);
        let _ = message.completion.send(Err(PoolError::Timeout(format!(
            "no reply within {}ms",
            timeout.as_millis()
        ))));

        self.try_resolve_flush();
        self.process_queue();
    }

    /// Wait until both queue and pending are empty
    ///
    /// While a flush is outstanding `send` fails immediately. Repeated calls
    /// share the same outstanding flush.
    pub fn flush(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let wait = {
            let mut state = self.inner.state.lock();
            match &state.flush {
                Some((_, wait)) => wait.clone(),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let wait = rx.shared();
                    state.flush = Some((tx, wait.clone()));
                    wait
                }
            }
        };

        self.try_resolve_flush();

        async move {
            wait.await
                .map_err(|_| PoolError::IllegalState("flush abandoned".to_string()))
        }
    }

    /// Drop an outstanding flush, failing its waiters and accepting sends again
    pub fn abandon_flush(&self) {
        if self.inner.state.lock().flush.take().is_some() {
            debug!("{}: flush abandoned", self.inner.config.name);
        }
    }

    fn try_resolve_flush(&self) {
        let done = self.inner.state.lock().take_flush_if_drained();
        if let Some(tx) = done {
            trace!("{}: flushed", self.inner.config.name);
            let _ = tx.send(());
        }
    }

    /// Stop or resume transmission of queued messages
    pub fn set_paused(&self, paused: bool) {
        self.inner.state.lock().paused = paused;
        if !paused {
            self.process_queue();
        }
    }

    /// Move every pending message back to the head of the queue
    ///
    /// Messages keep their relative order and receive new ids. The queue is
    /// not processed; the next send, reply or unpause does that.
    pub fn reset_pending(&self) {
        let mut state = self.inner.state.lock();
        let mut requeued: Vec<Message<T, R>> = state.pending.drain(..).map(|(_, m)| m).collect();
        if requeued.is_empty() {
            return;
        }

        for message in requeued.iter_mut() {
            message.stop_timer();
            message.id = state.allocate_id();
        }
        debug!(
            "{}: requeueing {} pending messages",
            self.inner.config.name,
            requeued.len()
        );
        for message in requeued.into_iter().rev() {
            state.queue.push_front(message);
        }
    }

    /// Discard every pending message without requeueing
    ///
    /// Their futures fail with an illegal-state error.
    pub fn clear_pending(&self) {
        self.fail_pending(PoolError::IllegalState(
            "message discarded before a reply arrived".to_string(),
        ));
    }

    /// Reject every pending message with `error`; queued messages stay
    pub fn fail_pending(&self, error: PoolError) {
        let failed: Vec<Message<T, R>> = {
            let mut state = self.inner.state.lock();
            state.pending.drain(..).map(|(_, m)| m).collect()
        };
        self.settle_failed(failed, error);
    }

    /// Reject every queued and pending message with `error`
    pub fn fail_all(&self, error: PoolError) {
        let failed: Vec<Message<T, R>> = {
            let mut state = self.inner.state.lock();
            let mut failed: Vec<Message<T, R>> = state.pending.drain(..).map(|(_, m)| m).collect();
            failed.extend(state.queue.drain(..));
            failed
        };
        self.settle_failed(failed, error);
    }

    fn settle_failed(&self, failed: Vec<Message<T, R>>, error: PoolError) {
        if !failed.is_empty() {
            debug!(
                "{}: failing {} messages: {}",
                self.inner.config.name,
                failed.len(),
                error
            );
        }
        for mut message in failed {
            message.stop_timer();
            let _ = message.completion.send(Err(error.clone()));
        }

        self.try_resolve_flush();
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.queue.is_empty() && state.pending.is_empty()
    }

    /// True when no more messages can be transmitted until a reply arrives
    pub fn at_capacity(&self) -> bool {
        self.inner.state.lock().pending.len() >= self.inner.config.max_pending
    }

    pub fn flushing(&self) -> bool {
        self.inner.state.lock().flush.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }
}
