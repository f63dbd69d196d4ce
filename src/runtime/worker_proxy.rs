// src/runtime/worker_proxy.rs
//! Callable view of the work module's exported methods
//!
//! Built from the interface a worker reports for `iface`. Each method can
//! be awaited or given a completion callback.

use crate::runtime::call::Call;
use crate::runtime::call_dispatcher::CallDispatcher;
use crate::utils::errors::{PoolError, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// One callable per exported method
#[derive(Clone)]
pub struct WorkerProxy {
    dispatcher: Arc<CallDispatcher>,
    methods: Arc<BTreeSet<String>>,
}

impl WorkerProxy {
    pub fn new(dispatcher: Arc<CallDispatcher>, methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            dispatcher,
            methods: Arc::new(methods.into_iter().collect()),
        }
    }

    /// Exported method names in sorted order
    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    /// Look up a method; fails for names the worker does not export
    pub fn method(&self, name: &str) -> Result<ProxyMethod> {
        if !self.has_method(name) {
            return Err(PoolError::MethodNotFound(name.to_string()));
        }
        Ok(ProxyMethod {
            dispatcher: Arc::clone(&self.dispatcher),
            name: name.to_string(),
        })
    }

    /// Shorthand for `method(name)?.call(args)`
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        self.method(name)?.call(args).await
    }
}

impl fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("methods", &self.methods)
            .finish()
    }
}

/// A single exported method
#[derive(Clone)]
pub struct ProxyMethod {
    dispatcher: Arc<CallDispatcher>,
    name: String,
}

impl ProxyMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the method; `args` is normalized like [`Call::new`]
    pub fn call(&self, args: Value) -> BoxFuture<'static, Result<Value>> {
        let (call, completion) = Call::new(self.name.clone(), args);
        self.dispatcher.dispatch(call);
        completion.boxed()
    }

    /// Invoke the method and hand the outcome to `callback`
    pub fn call_with<F>(&self, args: Value, callback: F)
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let reply = self.call(args);
        tokio::spawn(async move {
            callback(reply.await);
        });
    }
}

impl fmt::Debug for ProxyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyMethod").field("name", &self.name).finish()
    }
}
