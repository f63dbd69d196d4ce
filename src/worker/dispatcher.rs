// src/worker/dispatcher.rs
//! Worker-side operation dispatcher
//!
//! Decodes request lines, runs the matching op against the loaded work
//! module and produces one reply per request id:
//!
//! | op       | reply                          |
//! |----------|--------------------------------|
//! | `init`   | `{"pid": n}` after loading     |
//! | `iface`  | `{"iface": [names...]}`        |
//! | `ping`   | `{"pid": n}`                   |
//! | `die`    | `null`, then the loop returns  |
//! | `invoke` | method result or error         |

use crate::protocol::{self, IfaceReply, Op, PidReply, Request, Response};
use crate::utils::errors::RemoteError;
use crate::worker::module::{ModuleRegistry, WorkModule};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Why the dispatch loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// A `die` op was acknowledged
    Died,
    /// The parent closed the request stream
    InputClosed,
}

/// Dispatches operations for a single worker
pub struct WorkerDispatcher {
    registry: Arc<ModuleRegistry>,
    pid: u32,
    module: Option<Arc<WorkModule>>,
}

enum Action {
    Reply(Response),
    Invoke {
        id: u64,
        module: Arc<WorkModule>,
        method: String,
        args: Vec<Value>,
    },
    Die(u64),
    Ignore,
}

impl WorkerDispatcher {
    pub fn new(registry: Arc<ModuleRegistry>, pid: u32) -> Self {
        Self {
            registry,
            pid,
            module: None,
        }
    }

    /// Serve requests until `die` or until the request stream closes
    ///
    /// Invocations run concurrently; replies are sent in completion order.
    /// Invocations still running when the loop returns are abandoned.
    pub async fn serve(
        mut self,
        mut lines: mpsc::UnboundedReceiver<String>,
        replies: mpsc::UnboundedSender<Response>,
    ) -> ServeExit {
        let mut invocations = JoinSet::new();

        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        debug!("Worker {}: request stream closed", self.pid);
                        return ServeExit::InputClosed;
                    };

                    match self.handle_line(&line) {
                        Action::Reply(response) => {
                            let _ = replies.send(response);
                        }
                        Action::Invoke { id, module, method, args } => {
                            let replies = replies.clone();
                            invocations.spawn(async move {
                                let response = match module.call(&method, args).await {
                                    Ok(value) => Response::ok(id, value),
                                    Err(err) => {
                                        debug!("Method {} failed: {}", method, err);
                                        Response::err(id, err)
                                    }
                                };
                                let _ = replies.send(response);
                            });
                        }
                        Action::Die(id) => {
                            info!("Worker {}: exiting on request", self.pid);
                            let _ = replies.send(Response::ok(id, Value::Null));
                            return ServeExit::Died;
                        }
                        Action::Ignore => {}
                    }
                }
                Some(joined) = invocations.join_next(), if !invocations.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Worker {}: invocation task panicked", self.pid);
                        }
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Action {
        if line.trim().is_empty() {
            return Action::Ignore;
        }

        let request: Request = match protocol::from_line(line) {
            Ok(request) => request,
            Err(e) => {
                // Answer a well-formed envelope with an unknown op; drop the rest
                return match protocol::peek_id(line) {
                    Some((id, op)) => Action::Reply(Response::err(
                        id,
                        RemoteError::new(format!(
                            "Invalid op: {}",
                            op.unwrap_or_else(|| "<missing>".to_string())
                        )),
                    )),
                    None => {
                        warn!("Worker {}: dropping unreadable request: {}", self.pid, e);
                        Action::Ignore
                    }
                };
            }
        };

        let id = request.id;
        match request.message {
            Op::Init { module_name } => match self.registry.load(&module_name) {
                Ok(module) => {
                    debug!("Worker {}: loaded module {}", self.pid, module_name);
                    self.module = Some(Arc::new(module));
                    Action::Reply(self.pid_reply(id))
                }
                Err(err) => Action::Reply(Response::err(id, err)),
            },
            Op::Iface {} => match &self.module {
                Some(module) => Action::Reply(encode_reply(
                    id,
                    &IfaceReply {
                        iface: module.interface(),
                    },
                )),
                None => Action::Reply(Response::err(id, not_initialized())),
            },
            Op::Ping {} => Action::Reply(self.pid_reply(id)),
            Op::Die {} => Action::Die(id),
            Op::Invoke { method, args } => match &self.module {
                Some(module) => Action::Invoke {
                    id,
                    module: Arc::clone(module),
                    method,
                    args,
                },
                None => Action::Reply(Response::err(id, not_initialized())),
            },
        }
    }

    fn pid_reply(&self, id: u64) -> Response {
        encode_reply(id, &PidReply { pid: self.pid })
    }
}

fn encode_reply<T: serde::Serialize>(id: u64, reply: &T) -> Response {
    match serde_json::to_value(reply) {
        Ok(value) => Response::ok(id, value),
        Err(e) => Response::err(id, RemoteError::new(e.to_string())),
    }
}

fn not_initialized() -> RemoteError {
    RemoteError::typed("IllegalStateError", "Worker has not been initialized")
}
