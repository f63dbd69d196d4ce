// src/worker/stdio.rs
//! Worker entry point over the process's stdin/stdout
//!
//! Requests arrive one per line on stdin; replies are written one per line
//! on stdout. Logging must go to stderr.

use crate::protocol::{self, Response};
use crate::worker::dispatcher::{ServeExit, WorkerDispatcher};
use crate::worker::module::ModuleRegistry;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, warn};

/// Serve requests from stdin until `die` or end of input
///
/// Every reply produced before the dispatcher returns is written out before
/// this function returns. The caller should exit the process afterwards:
/// the stdin reader may still be parked in a blocking read.
pub async fn run_worker(registry: ModuleRegistry) -> ServeExit {
    let pid = std::process::id();
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Response>();

    let reader = tokio::spawn(async move {
        let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Worker {}: failed to read request: {}", pid, e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = reply_rx.recv().await {
            let mut line = match protocol::to_line(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!("Worker {}: failed to encode reply {}: {}", pid, response.id, e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                warn!("Worker {}: failed to write reply: {}", pid, e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    debug!("Worker {} ready", pid);
    let exit = WorkerDispatcher::new(Arc::new(registry), pid)
        .serve(line_rx, reply_tx)
        .await;

    // The writer ends once every reply sender is gone
    let _ = writer.await;
    reader.abort();

    exit
}
