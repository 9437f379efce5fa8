//! promptqd - worker orchestration daemon
//!
//! Boots the core against the configured store: sweeps worker records left
//! over from a previous run, starts the metric sampler and the periodic
//! dispatch pump, and tears live workers down on ctrl-c. The client-facing
//! API layers on top of the library; this binary is the operational shell.

use anyhow::{Context, Result};
use clap::Parser;
use promptq::{
    default_probe, CoreConfig, RuntimeLocator, Sampler, Scheduler, Store, WorkerManager,
    WorkerStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "promptqd")]
#[command(about = "Worker orchestration and prompt queue daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database location (overrides config and STORAGE_URL)
    #[arg(long)]
    storage: Option<String>,

    /// Worker install directory (overrides config)
    #[arg(long)]
    install_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Worker process output is re-emitted under the "worker" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,worker=debug.
    let filter = if args.verbose {
        EnvFilter::new("promptq=debug,worker=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting promptqd");

    let mut config = match &args.config {
        Some(path) => CoreConfig::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CoreConfig::default(),
    };
    config = config.apply_env();
    if let Some(storage) = args.storage {
        config.storage_url = storage;
    }
    if let Some(install_path) = args.install_path {
        config.install_path = install_path;
    }

    info!(
        storage = %config.storage_url,
        install = %config.install_path.display(),
        "Configuration loaded"
    );

    let store = Arc::new(
        Store::open(&config.storage_url)
            .with_context(|| format!("Failed to open store at {}", config.storage_url))?,
    );
    store
        .set_config(
            promptq::store::WORKER_INSTALL_PATH_KEY,
            &config.install_path.to_string_lossy(),
            Some("Directory containing the worker program"),
        )
        .context("Failed to persist install path")?;

    sweep_orphans(&store)?;

    let probe = default_probe();
    let locator = Arc::new(RuntimeLocator::new(store.clone()));
    let manager = Arc::new(WorkerManager::new(
        store.clone(),
        probe.clone(),
        locator,
        config.install_path.clone(),
        config.timeouts(),
    ));

    let scheduler = Scheduler::new(store.clone(), config.timeouts().api);
    let sampler = Sampler::new(store.clone(), probe);
    let mut sampler_handle = sampler.start(config.sampler_interval());

    // Periodic dispatch pump: picks up jobs enqueued by API handlers in
    // other processes and pairs freed workers with waiting work.
    let pump = {
        let scheduler = scheduler.clone();
        let interval = config.dispatch_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.try_dispatch().await {
                    warn!(error = %e, "Dispatch pump failed");
                }
            }
        })
    };

    info!("promptqd running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    pump.abort();
    sampler_handle.stop();
    for snapshot in manager.get_all().await {
        if snapshot.pid.is_some() {
            if let Err(e) = manager.stop(snapshot.id).await {
                warn!(worker = %snapshot.id, error = %e, "Failed to stop worker during shutdown");
            }
        }
    }

    Ok(())
}

/// Reset worker records stranded by a previous daemon run. Their child
/// handles are gone, so whatever the row claims, this process cannot manage
/// them.
fn sweep_orphans(store: &Store) -> Result<()> {
    for status in [WorkerStatus::Starting, WorkerStatus::Running] {
        for worker in store.workers_with_status(status)? {
            warn!(
                worker = %worker.id,
                name = %worker.name,
                pid = ?worker.pid,
                "Resetting worker record from a previous run"
            );
            store.update_worker_status(worker.id, WorkerStatus::Stopped, None, None)?;
        }
    }
    Ok(())
}
