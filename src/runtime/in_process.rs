// src/runtime/in_process.rs
//! Launcher hosting workers on tokio tasks
//!
//! Each "process" is a [`WorkerDispatcher`] task fed encoded request lines,
//! so the wire protocol is exercised end to end. Pids are synthetic. Any
//! signal aborts the task and is reported as the exit signal, which is
//! enough to model graceful and forced kills without OS processes.
//!
//! Work methods that block the thread or exit the process affect the whole
//! host here; use [`CommandLauncher`](super::process_manager::CommandLauncher)
//! for those.

use crate::protocol::{self, Request, Response};
use crate::runtime::process_manager::{
    ExitInfo, Launcher, ProcessControl, ProcessLink, TransportEvent,
};
use crate::utils::errors::Result;
use crate::worker::dispatcher::{ServeExit, WorkerDispatcher};
use crate::worker::module::ModuleRegistry;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// First synthetic pid handed out
const FIRST_PID: u32 = 100_000;

/// Runs workers as tasks inside the current runtime
#[derive(Debug)]
pub struct InProcessLauncher {
    registry: Arc<ModuleRegistry>,
    next_pid: AtomicU32,
}

impl InProcessLauncher {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            next_pid: AtomicU32::new(FIRST_PID),
        }
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self) -> Result<ProcessLink> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Request>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Response>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Encode requests exactly as they would hit a child's stdin
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                match protocol::to_line(&request) {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Worker {}: failed to encode request: {}", pid, e),
                }
            }
        });

        let forward_events = event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(response) = reply_rx.recv().await {
                if forward_events.send(TransportEvent::Reply(response)).is_err() {
                    break;
                }
            }
        });

        let serve = tokio::spawn(
            WorkerDispatcher::new(Arc::clone(&self.registry), pid).serve(line_rx, reply_tx),
        );

        let control = Arc::new(TaskControl {
            abort: serve.abort_handle(),
            signal: Mutex::new(None),
        });

        let exit_control = Arc::clone(&control);
        tokio::spawn(async move {
            let info = match serve.await {
                Ok(ServeExit::Died) | Ok(ServeExit::InputClosed) => ExitInfo {
                    code: Some(0),
                    signal: None,
                },
                Err(e) if e.is_panic() => ExitInfo {
                    code: Some(101),
                    signal: None,
                },
                Err(_) => {
                    let recorded = *exit_control.signal.lock();
                    ExitInfo {
                        code: None,
                        signal: Some(recorded.unwrap_or(Signal::SIGKILL) as i32),
                    }
                }
            };

            // Replies written before the exit are delivered first
            let _ = forwarder.await;
            debug!("Worker {} exited ({:?})", pid, info);
            let _ = event_tx.send(TransportEvent::Exited(info));
        });

        debug!("Started in-process worker {}", pid);
        Ok(ProcessLink {
            pid,
            outbound: outbound_tx,
            events: event_rx,
            control,
        })
    }
}

struct TaskControl {
    abort: AbortHandle,
    signal: Mutex<Option<Signal>>,
}

impl ProcessControl for TaskControl {
    fn signal(&self, signal: Signal) -> Result<()> {
        if self.abort.is_finished() {
            return Ok(());
        }
        self.signal.lock().get_or_insert(signal);
        self.abort.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;
    use crate::worker::demo;
    use serde_json::json;

    async fn next_reply(link: &mut ProcessLink) -> Response {
        match link.events.recv().await.unwrap() {
            TransportEvent::Reply(response) => response,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_die() {
        let launcher = InProcessLauncher::new(demo::registry());
        let mut link = launcher.launch().unwrap();
        assert_eq!(link.pid, FIRST_PID);

        link.outbound
            .send(Request {
                id: 1,
                message: Op::Init {
                    module_name: demo::MODULE_NAME.to_string(),
                },
            })
            .unwrap();
        assert_eq!(next_reply(&mut link).await.message, Some(json!({ "pid": FIRST_PID })));

        link.outbound
            .send(Request {
                id: 2,
                message: Op::Die {},
            })
            .unwrap();
        assert_eq!(next_reply(&mut link).await.id, 2);

        match link.events.recv().await.unwrap() {
            TransportEvent::Exited(info) => assert_eq!(info.code, Some(0)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signal_reports_exit_signal() {
        let launcher = InProcessLauncher::new(demo::registry());
        let first = launcher.launch().unwrap();
        let mut link = launcher.launch().unwrap();
        assert_eq!(link.pid, first.pid + 1);

        link.control.signal(Signal::SIGKILL).unwrap();
        match link.events.recv().await.unwrap() {
            TransportEvent::Exited(info) => {
                assert_eq!(info.code, None);
                assert_eq!(info.signal, Some(Signal::SIGKILL as i32));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
