// src/runtime/call.rs
//! A method call travelling through the dispatcher
//!
//! The caller keeps the [`CallCompletion`]; everything else holds the
//! `Arc<Call>`. Only the first `resolve`/`reject` takes effect.

use crate::runtime::worker_handle::WorkerHandle;
use crate::utils::errors::{PoolError, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// Method name, arguments and the caller's completion
pub struct Call {
    method: String,
    args: Vec<Value>,
    completion: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

/// Future side of a [`Call`], settled exactly once
pub struct CallCompletion {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for CallCompletion {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| {
                Err(PoolError::IllegalState(
                    "call dropped before it settled".to_string(),
                ))
            })
        })
    }
}

impl Call {
    /// Create a call, normalizing `args` into an argument list
    pub fn new(method: impl Into<String>, args: Value) -> (Arc<Self>, CallCompletion) {
        Self::with_args(method, normalize_args(args))
    }

    pub fn with_args(method: impl Into<String>, args: Vec<Value>) -> (Arc<Self>, CallCompletion) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(Self {
            method: method.into(),
            args,
            completion: Mutex::new(Some(tx)),
        });
        (call, CallCompletion { rx })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn is_settled(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Returns false if the call was already settled
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    /// Returns false if the call was already settled
    pub fn reject(&self, error: PoolError) -> bool {
        self.settle(Err(error))
    }

    /// Reject with a timeout error
    pub fn timeout(&self, message: impl Into<String>) -> bool {
        self.reject(PoolError::Timeout(message.into()))
    }

    fn settle(&self, outcome: Result<Value>) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            trace!("{} already settled", self);
            return false;
        };
        // The caller may have stopped waiting; the call still counts as settled
        let _ = tx.send(outcome);
        true
    }

    /// Run the call on `worker` and settle it with the outcome
    ///
    /// A failure is returned as well as delivered to the caller.
    pub fn invoke(self: &Arc<Self>, worker: &WorkerHandle) -> BoxFuture<'static, Result<()>> {
        let reply = worker.invoke(self.method.clone(), self.args.clone());
        let call = Arc::clone(self);
        async move {
            match reply.await {
                Ok(value) => {
                    call.resolve(value);
                    Ok(())
                }
                Err(e) => {
                    call.reject(e.clone());
                    Err(e)
                }
            }
        }
        .boxed()
    }
}

/// Argument list for a JSON value
///
/// An array supplies the arguments, `null` means none and any other value
/// is a single argument.
pub fn normalize_args(args: Value) -> Vec<Value> {
    match args {
        Value::Array(args) => args,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Call[method={}, args={}]", self.method, self.args.len())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_args() {
        assert_eq!(normalize_args(json!([1, "two"])), vec![json!(1), json!("two")]);
        assert_eq!(normalize_args(Value::Null), Vec::<Value>::new());
        assert_eq!(normalize_args(json!("foo")), vec![json!("foo")]);
        assert_eq!(normalize_args(json!({"a": 1})), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let (call, completion) = Call::new("returnResult", json!("foo"));
        assert_eq!(call.method(), "returnResult");
        assert_eq!(call.args(), &[json!("foo")]);

        assert!(call.resolve(json!(1)));
        assert!(!call.reject(PoolError::AtCapacity("full".to_string())));
        assert!(!call.timeout("late"));
        assert!(call.is_settled());
        assert_eq!(completion.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_timeout_and_drop() {
        let (call, completion) = Call::new("waitFor", json!(10));
        call.timeout("took too long");
        assert!(completion.await.unwrap_err().is_timeout());

        let (call, completion) = Call::new("waitFor", Value::Null);
        assert_eq!(call.to_string(), "Call[method=waitFor, args=0]");
        drop(call);
        assert!(matches!(
            completion.await.unwrap_err(),
            PoolError::IllegalState(_)
        ));
    }
}
