// src/worker/module.rs
//! Work modules hosted by a worker process
//!
//! A method handler receives its arguments and a [`Responder`] and may reply
//! in any of these ways:
//!
//! - return [`Outcome::Value`] or [`Outcome::Error`]
//! - panic (reported as an error of type `Panic`)
//! - return [`Outcome::Future`]
//! - return [`Outcome::Deferred`] and settle the responder later
//!
//! All of them reduce to one `Result<Value, RemoteError>`. Whichever
//! settlement happens first is the reply; later ones are ignored.

use crate::utils::errors::RemoteError;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use tokio::sync::oneshot;

thread_local! {
    /// Location of the last panic on this thread
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Record panic locations for error replies; the previous hook still runs
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(location.to_string()));
            }
            previous(info);
        }));
    });
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> RemoteError {
    let error = RemoteError::from_panic(payload);
    match PANIC_LOCATION.with(|slot| slot.borrow_mut().take()) {
        Some(location) => error.with_stack(format!("at {}", location)),
        None => error,
    }
}

fn abandoned(method: &str) -> RemoteError {
    RemoteError::new(format!(
        "{} dropped its responder without replying",
        method
    ))
}

/// Reply of a single method invocation
pub type MethodResult = std::result::Result<Value, RemoteError>;

/// What a method handler returned
pub enum Outcome {
    Value(Value),
    Error(RemoteError),
    Future(BoxFuture<'static, MethodResult>),
    /// The handler settles the responder itself
    Deferred,
}

impl From<MethodResult> for Outcome {
    fn from(result: MethodResult) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Error(err),
        }
    }
}

/// Callback-style reply channel handed to every method
///
/// Clones share the same slot; only the first settlement counts.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<Mutex<Option<oneshot::Sender<MethodResult>>>>,
}

impl Responder {
    fn channel() -> (Self, oneshot::Receiver<MethodResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Settle with a result; returns false if already settled
    pub fn settle(&self, result: MethodResult) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: RemoteError) -> bool {
        self.settle(Err(error))
    }

    /// Node-style `(err, value)` completion
    pub fn callback(&self, error: Option<RemoteError>, value: Value) -> bool {
        match error {
            Some(error) => self.reject(error),
            None => self.resolve(value),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

type Handler = Arc<dyn Fn(Vec<Value>, Responder) -> Outcome + Send + Sync>;

/// A named set of methods callable through `invoke`
#[derive(Clone)]
pub struct WorkModule {
    name: String,
    methods: BTreeMap<String, Handler>,
}

impl fmt::Debug for WorkModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkModule")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler with full control over its reply
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) -> Outcome + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a handler that returns its reply directly
    pub fn sync<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        self.method(name, move |args, _| handler(args).into())
    }

    /// Register a handler that replies through a future
    pub fn future<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.method(name, move |args, _| Outcome::Future(handler(args).boxed()))
    }

    /// Register a handler that replies through its responder
    pub fn callback<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.method(name, move |args, responder| {
            handler(args, responder);
            Outcome::Deferred
        })
    }

    /// Exported method names, sorted
    pub fn interface(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Run a method to its first settlement
    ///
    /// Panics in the handler or in its future become `Panic` errors. A
    /// handler that drops every responder clone without settling yields an
    /// error instead of hanging.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> MethodResult {
        let Some(handler) = self.methods.get(method).cloned() else {
            return Err(RemoteError::new(format!(
                "Worker method not found: {}",
                method
            )));
        };

        install_panic_hook();
        PANIC_LOCATION.with(|slot| slot.borrow_mut().take());

        let (responder, mut rx) = Responder::channel();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler(args, responder.clone())
        }));

        let settled = match outcome {
            Err(panic) => Some(Err(panic_error(panic))),
            Ok(Outcome::Value(value)) => Some(Ok(value)),
            Ok(Outcome::Error(err)) => Some(Err(err)),
            Ok(Outcome::Future(fut)) => {
                if responder.is_settled() {
                    None
                } else {
                    // A callback settling first replies without waiting for the future
                    tokio::select! {
                        result = AssertUnwindSafe(fut).catch_unwind() => Some(match result {
                            Ok(result) => result,
                            Err(panic) => Err(panic_error(panic)),
                        }),
                        early = &mut rx => {
                            return early.unwrap_or_else(|_| Err(abandoned(method)));
                        }
                    }
                }
            }
            Ok(Outcome::Deferred) => None,
        };

        if let Some(result) = settled {
            responder.settle(result);
        }
        drop(responder);

        rx.await.unwrap_or_else(|_| Err(abandoned(method)))
    }
}

type Factory = Arc<dyn Fn() -> WorkModule + Send + Sync>;

/// Work modules a worker can load by name during `init`
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Factory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> WorkModule + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn load(&self, name: &str) -> std::result::Result<WorkModule, RemoteError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RemoteError::new(format!("Cannot find work module '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}
