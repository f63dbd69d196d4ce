// src/worker/demo.rs
//! Built-in `demo` work module
//!
//! Exercises every reply style plus the failure modes the pool must survive
//! (`spin` wedges the worker, `drop` never replies, `crash` exits). `spin` and
//! `crash` take down the whole process; only call them in real workers.

use crate::utils::errors::RemoteError;
use crate::worker::module::{MethodResult, ModuleRegistry, Outcome, WorkModule};
use serde_json::{json, Value};
use std::time::Duration;

pub const MODULE_NAME: &str = "demo";

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

fn millis(args: &[Value], index: usize) -> Duration {
    Duration::from_millis(args.get(index).and_then(Value::as_u64).unwrap_or(0))
}

fn failure() -> RemoteError {
    RemoteError::new("I suck")
}

/// Build the demo module
pub fn module() -> WorkModule {
    WorkModule::new(MODULE_NAME)
        .sync("returnResult", |args| Ok(arg(&args, 0)))
        .sync("returnTwoResults", |args| Ok(json!([arg(&args, 0), arg(&args, 1)])))
        .sync("returnThreeResults", |args| {
            Ok(json!([arg(&args, 0), arg(&args, 1), arg(&args, 2)]))
        })
        .callback("callbackResultNow", |args, responder| {
            responder.callback(None, arg(&args, 0));
        })
        .callback("callbackResultLater", |args, responder| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                responder.callback(None, arg(&args, 0));
            });
        })
        .future("promiseResultNow", |args| async move { MethodResult::Ok(arg(&args, 0)) })
        .future("promiseResultLater", |args| async move {
            tokio::task::yield_now().await;
            MethodResult::Ok(arg(&args, 0))
        })
        .method("returnError", |_, _| Outcome::Error(failure()))
        .method("throwError", |_, _| panic!("I suck"))
        .callback("callbackErrorNow", |_, responder| {
            responder.callback(Some(failure()), Value::Null);
        })
        .callback("callbackErrorLater", |_, responder| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                responder.callback(Some(failure()), Value::Null);
            });
        })
        .future("promiseErrorNow", |_| async { MethodResult::Err(failure()) })
        .future("promiseErrorLater", |_| async {
            tokio::task::yield_now().await;
            MethodResult::Err(failure())
        })
        .callback("waitFor", |args, responder| {
            let delay = millis(&args, 0);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                responder.resolve(Value::Null);
            });
        })
        .future("sleepThenReturn", |args| async move {
            tokio::time::sleep(millis(&args, 0)).await;
            MethodResult::Ok(arg(&args, 1))
        })
        .callback("spin", |_, responder| {
            responder.resolve(Value::Null);
            // Let the reply go out, then block the runtime thread for good
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                loop {
                    std::thread::sleep(Duration::from_millis(100));
                }
            });
        })
        .callback("drop", |_, responder| {
            tokio::spawn(async move {
                let _held = responder;
                futures::future::pending::<()>().await;
            });
        })
        .sync("pid", |_| Ok(json!(std::process::id())))
        .sync("crash", |args| {
            std::process::exit(exit_code(&args))
        })
}

/// Exit status for `crash`; 70 unless a valid i32 is given
fn exit_code(args: &[Value]) -> i32 {
    args.first()
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(70)
}

/// Registry holding only the demo module
pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new().register(MODULE_NAME, module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_exit_code() {
        assert_eq!(exit_code(&[json!(3)]), 3);
        assert_eq!(exit_code(&[]), 70);
        assert_eq!(exit_code(&[json!(i64::from(i32::MAX) + 1)]), 70);
        assert_eq!(exit_code(&[json!("nope")]), 70);
    }

    #[tokio::test]
    async fn test_return_styles() {
        let demo = module();
        let pair = demo
            .call("returnTwoResults", vec![json!(1), json!(2)])
            .await
            .unwrap();
        assert_eq!(pair, json!([1, 2]));
        assert_eq!(demo.call("returnResult", vec![]).await.unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for() {
        let demo = module();
        let start = tokio::time::Instant::now();
        demo.call("waitFor", vec![json!(300)]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_drop_never_replies() {
        let demo = module();
        let reply = tokio::time::timeout(Duration::from_millis(50), demo.call("drop", vec![])).await;
        assert!(reply.is_err());
    }

    #[test]
    fn test_registry_has_demo() {
        let registry = registry();
        assert!(registry.contains(MODULE_NAME));
        assert!(registry.load(MODULE_NAME).unwrap().has_method("spin"));
    }
}
