//! gpushare daemon
//!
//! Serves the API and runs the reservation sweep, the stale GPU check and,
//! when enabled, the collector poll loop.

use anyhow::Context;
use clap::Parser;
use gpushare_api::{create_router, AppState};
use gpushare_core::{Clock, DaemonConfig, SystemClock};
use gpushare_notify::{Broadcaster, ChannelBroadcaster, LogNotifier, Notices, Notifier};
use gpushare_reconciler::{CollectorClient, Reconciler};
use gpushare_scheduler::QueueEngine;
use gpushare_store::EntityStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// gpushare daemon - shared GPU reservation queue
#[derive(Parser, Debug)]
#[command(name = "gpushared")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server (overrides the config file)
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

fn every(secs: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(address) = args.address {
        config.api.address = address;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting gpushare daemon v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(EntityStore::new());
    store.load(&config).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let events = Arc::new(ChannelBroadcaster::new());
    let broadcaster: Arc<dyn Broadcaster> = events.clone();
    let notices = Notices::new(&config.notifications);

    let engine = Arc::new(QueueEngine::new(
        store.clone(),
        notifier.clone(),
        broadcaster.clone(),
        clock.clone(),
        notices.clone(),
        config.reservations.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        notifier,
        broadcaster,
        clock,
        notices,
        config.reconciler.clone(),
    ));

    {
        let engine = engine.clone();
        let mut ticker = every(config.reservations.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let report = engine.sweep().await;
                debug!(
                    expired = report.expired,
                    reminded = report.reminded,
                    "Reservation sweep tick"
                );
            }
        });
    }

    {
        let reconciler = reconciler.clone();
        let mut ticker = every(config.reconciler.stale_check_interval_secs);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let marked = reconciler.detect_stale().await;
                debug!(marked = marked, "Stale GPU check tick");
            }
        });
    }

    if config.reconciler.poll.enabled {
        let client = CollectorClient::new(&config.reconciler.poll)?;
        let reconciler = reconciler.clone();
        let mut ticker = every(config.reconciler.poll.interval_secs);
        info!(
            interval_secs = config.reconciler.poll.interval_secs,
            path = %config.reconciler.poll.path,
            "Collector polling enabled"
        );
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let results = client.poll_all(&reconciler).await;
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                debug!(devices = results.len(), failed = failed, "Collector poll tick");
            }
        });
    }

    let router = create_router(AppState {
        engine,
        reconciler,
        store,
        events,
        user_header: config.api.user_header.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid listen address")?;

    info!("API server listening on {}", addr);
    info!(
        usage_period_secs = config.reservations.usage_period_secs,
        stale_after_secs = config.reconciler.stale_after_secs,
        "Reservation and reconciliation timers armed"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}
