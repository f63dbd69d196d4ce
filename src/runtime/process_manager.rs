// src/runtime/process_manager.rs
//! Process manager for spawning worker processes
//!
//! A [`Launcher`] starts one worker and hands back a [`ProcessLink`]: an
//! outbound request channel, an ordered inbound event stream (replies,
//! transport errors, then exactly one exit) and a signal handle.
//!
//! [`CommandLauncher`] runs an executable speaking the JSON-lines protocol
//! on its stdin/stdout. The child's stderr is forwarded to `tracing`.

use crate::protocol::{self, Request, Response};
use crate::utils::errors::{PoolError, Result};
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

/// How long exit reporting waits for the child's stdout to drain
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a worker process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Inbound traffic from a worker process, in arrival order
#[derive(Debug)]
pub enum TransportEvent {
    Reply(Response),
    /// A line that could not be decoded, or a failed channel
    Error(PoolError),
    /// Always the last event of a process
    Exited(ExitInfo),
}

/// Signal delivery for one worker process
pub trait ProcessControl: Send + Sync {
    /// Deliver `signal`; a no-op once the process has exited
    fn signal(&self, signal: Signal) -> Result<()>;
}

/// Channels connected to a freshly launched worker
pub struct ProcessLink {
    pub pid: u32,
    pub outbound: mpsc::UnboundedSender<Request>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub control: Arc<dyn ProcessControl>,
}

impl fmt::Debug for ProcessLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLink").field("pid", &self.pid).finish()
    }
}

/// Starts worker processes
///
/// Must be called from within a tokio runtime.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<ProcessLink>;
}

/// Launches an executable that speaks the worker protocol on stdio
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    /// Executable path
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<OsString>,

    /// Environment variables added to the inherited environment
    pub env_vars: Vec<(String, String)>,

    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env_vars: vec![],
            work_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: Vec<(String, String)>) -> Self {
        self.env_vars.extend(vars);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self) -> Result<ProcessLink> {
        debug!("Spawning worker process: {:?} {:?}", self.program, self.args);

        let mut command = Command::new(&self.program);
        command.args(&self.args);

        if let Some(work_dir) = &self.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &self.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            PoolError::ProcessSpawnFailed(format!("{}: {}", self.program.display(), e))
        })?;

        let pid = child.id().ok_or_else(|| {
            PoolError::ProcessSpawnFailed("process exited before it could be tracked".to_string())
        })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(PoolError::ProcessSpawnFailed(
                "child stdio was not captured".to_string(),
            ));
        };

        debug!("Process spawned with PID: {}", pid);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Request>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        // Writer: requests to stdin, one line each
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let mut line = match protocol::to_line(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Worker {}: failed to encode request {}: {}", pid, request.id, e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!("Worker {}: stdin closed: {}", pid, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    debug!("Worker {}: stdin flush failed: {}", pid, e);
                    break;
                }
            }
        });

        // Reader: reply lines from stdout
        let reader_events = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let event = match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => match protocol::from_line::<Response>(&line) {
                        Ok(response) => TransportEvent::Reply(response),
                        Err(e) => TransportEvent::Error(e),
                    },
                    Err(e) => {
                        let _ = reader_events.send(TransportEvent::Error(PoolError::Transport(
                            format!("failed to read worker stdout: {}", e),
                        )));
                        break;
                    }
                };
                if reader_events.send(event).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                debug!("Worker {} stderr: {}", pid, line);
            }
        });

        // Waiter: exit status, reported after stdout has drained
        let waiter_exited = Arc::clone(&exited);
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    warn!("Worker {}: failed to wait for exit: {}", pid, e);
                    ExitInfo::default()
                }
            };
            waiter_exited.store(true, Ordering::SeqCst);

            let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await;
            debug!(
                "Worker {} exited (code {:?}, signal {:?})",
                pid, info.code, info.signal
            );
            let _ = event_tx.send(TransportEvent::Exited(info));
        });

        Ok(ProcessLink {
            pid,
            outbound: outbound_tx,
            events: event_rx,
            control: Arc::new(PidControl { pid, exited }),
        })
    }
}

/// Signals an OS process by pid
struct PidControl {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for PidControl {
    fn signal(&self, signal: Signal) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        let pid = i32::try_from(self.pid)
            .map_err(|_| PoolError::Transport(format!("pid {} out of range", self.pid)))?;

        debug!("Sending {} to PID {}", signal, pid);
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Transport(format!(
                "Failed to send {} to {}: {}",
                signal, pid, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let launcher = CommandLauncher::new("/nonexistent/forkpool-worker");
        let err = launcher.launch().unwrap_err();
        assert!(matches!(err, PoolError::ProcessSpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_malformed_output_and_exit() {
        // One garbage line, then requests are echoed back verbatim
        let launcher = CommandLauncher::new("sh").args(["-c", "echo not-json; exec cat"]);
        let mut link = launcher.launch().unwrap();
        assert!(link.pid > 0);

        match link.events.recv().await.unwrap() {
            TransportEvent::Error(PoolError::Transport(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        link.outbound
            .send(Request {
                id: 1,
                message: Op::Ping {},
            })
            .unwrap();

        match link.events.recv().await.unwrap() {
            TransportEvent::Reply(response) => {
                assert_eq!(response.id, 1);
                assert_eq!(response.message.unwrap()["op"], "ping");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        link.control.signal(Signal::SIGKILL).unwrap();
        loop {
            if let TransportEvent::Exited(info) = link.events.recv().await.unwrap() {
                assert_eq!(info.signal, Some(Signal::SIGKILL as i32));
                break;
            }
        }

        // Signalling an exited process is a no-op
        link.control.signal(Signal::SIGKILL).unwrap();
    }

    #[test]
    fn test_builder() {
        let launcher = CommandLauncher::new("/bin/worker")
            .args(["worker", "--json"])
            .envs(vec![("RUST_LOG".to_string(), "debug".to_string())])
            .work_dir("/tmp");
        assert_eq!(launcher.args.len(), 2);
        assert_eq!(launcher.env_vars.len(), 1);
        assert_eq!(launcher.work_dir, Some(PathBuf::from("/tmp")));
    }
}
