//! stevedored — the Stevedore daemon.
//!
//! Single binary that assembles the deployment scheduling core in
//! standalone mode: redb-backed repositories, in-memory tracker and
//! launch queue (standalone has no external cluster), deployment
//! manager, and the scheduler core. The process elects itself leader
//! immediately; a real deployment would wire an election service
//! instead.
//!
//! # Usage
//!
//! ```text
//! stevedored --data-dir /var/lib/stevedore
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use stevedore_core::EventBus;
use stevedore_deploy::{DeployContext, DeploymentManager};
use stevedore_scheduler::{SchedulerActions, SchedulerCore, SchedulerDeps, SchedulerHandle};
use stevedore_state::{
    MemoryHealthChecks, MemoryInstanceTracker, MemoryLaunchQueue, RecordingDriver, StateStore,
};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "stevedored", about = "Stevedore deployment scheduler daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/stevedore")]
    data_dir: PathBuf,

    /// Optional TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stevedore=debug".parse().unwrap());
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = DaemonConfig::load(cli.config.as_deref())?;
    run(cli.data_dir, config).await
}

async fn run(data_dir: PathBuf, config: DaemonConfig) -> anyhow::Result<()> {
    info!("stevedore daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("stevedore.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Collaborators ──────────────────────────────────────────────

    // Standalone mode has no external cluster: the tracker acknowledges
    // kill goals itself and the launch queue fulfils launches directly.
    let tracker = MemoryInstanceTracker::reactive();
    let launch_queue = Arc::new(MemoryLaunchQueue::fulfilling(Arc::clone(&tracker)));
    let health_checks = Arc::new(MemoryHealthChecks::new());
    let driver = Arc::new(RecordingDriver::new());
    let events = EventBus::new(config.event_capacity);

    // ── Core ───────────────────────────────────────────────────────

    let ctx = DeployContext {
        tracker: tracker.clone(),
        launch_queue: launch_queue.clone(),
        health_checks: health_checks.clone(),
        events: events.clone(),
    };
    let manager = DeploymentManager::spawn(ctx, Arc::new(store.clone()));
    let actions = SchedulerActions {
        tracker: tracker.clone(),
        launch_queue: launch_queue.clone(),
        group_repo: Arc::new(store.clone()),
        driver,
    };
    let scheduler = SchedulerCore::spawn(SchedulerDeps {
        manager,
        repository: Arc::new(store.clone()),
        health_checks,
        actions,
        events: events.clone(),
    });
    info!("scheduler core spawned");

    // ── Background tasks ───────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let event_log = tokio::spawn(log_events(events.clone(), shutdown_rx.clone()));
    let reconcile_loop = tokio::spawn(reconcile_periodically(
        scheduler.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
        shutdown_rx.clone(),
    ));
    let scale_loop = tokio::spawn(scale_periodically(
        scheduler.clone(),
        store.clone(),
        Duration::from_secs(config.scale_interval_secs),
        shutdown_rx,
    ));

    // Standalone: no election service, become leader at once.
    scheduler.leader_elected().await?;
    info!("leadership acquired, scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler.standby().await?;
    let _ = shutdown_tx.send(true);
    let _ = event_log.await;
    let _ = reconcile_loop.await;
    let _ = scale_loop.await;

    info!("stevedore daemon stopped");
    Ok(())
}

/// Mirror scheduling events into the log.
async fn log_events(events: EventBus, mut shutdown: watch::Receiver<bool>) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => debug!(?event, "event"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn reconcile_periodically(
    scheduler: SchedulerHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Immediate first tick.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = scheduler.reconcile_tasks().await {
                    warn!(error = %err, "periodic reconciliation failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Nudge every run spec toward its target instance count.
async fn scale_periodically(
    scheduler: SchedulerHandle,
    store: StateStore,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let root = match store.get_root() {
                    Ok(root) => root,
                    Err(err) => {
                        warn!(error = %err, "cannot read group root for scale pass");
                        continue;
                    }
                };
                for id in root.transitive_ids() {
                    if let Err(err) = scheduler.scale_run_spec(id.clone()).await {
                        warn!(run_spec = %id, error = %err, "scale request failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
