// src/main.rs
//! forkpool binary
//!
//! `forkpool worker` runs a worker process speaking the wire protocol on
//! stdin/stdout and hosting the built-in `demo` module. Any other invocation
//! (`forkpool [config-path]`) runs a short demo against a pool of workers
//! forked from this executable.

use anyhow::{Context, Result};
use forkpool::observability::init_tracing;
use forkpool::worker::{demo, run_worker};
use forkpool::{BuildInfo, PoolConfig, ProcessPool};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

fn main() -> Result<()> {
    let json_logs = std::env::var("FORKPOOL_LOG_JSON").is_ok();
    init_tracing(json_logs);

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("worker") => run_worker_process(),
        Some("--version") => {
            println!("{}", BuildInfo::current());
            Ok(())
        }
        path => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(run_demo(path.map(PathBuf::from)))
        }
    }
}

/// Child side: one event loop on one thread
fn run_worker_process() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start worker runtime")?;

    let exit = runtime.block_on(run_worker(demo::registry()));
    info!("Worker {} exiting ({:?})", std::process::id(), exit);

    // stdin may still be held by a blocking read
    std::process::exit(0);
}

async fn run_demo(config_path: Option<PathBuf>) -> Result<()> {
    info!("Starting forkpool v{}", env!("CARGO_PKG_VERSION"));

    let config = match config_path {
        Some(path) => PoolConfig::load(Some(&path))
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PoolConfig {
            max_workers: 2,
            max_total_calls: Some(5),
            ..PoolConfig::new(demo::MODULE_NAME)
        },
    };
    info!("Configuration loaded: {:?}", config);

    let pool = ProcessPool::new(config)?;
    pool.start().await?;

    let proxy = pool.worker_proxy().await?;
    info!("Worker exports {} methods", proxy.methods().len());

    for i in 0..10 {
        let pid = pool.invoke("pid", json!(null)).await?;
        let echoed = proxy.call("promiseResultLater", json!([i])).await?;
        info!("Call {} served by pid {} -> {}", i, pid, echoed);
    }

    if let Err(e) = pool.invoke("throwError", json!(null)).await {
        error!("Remote error surfaced as expected: {}", e);
    }

    let report = json!({
        "build": BuildInfo::current(),
        "stats": pool.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.shutdown(false).await?;
    info!("Pool stopped");
    Ok(())
}
