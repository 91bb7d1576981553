//! Spreadbot - Cross-Venue Spread Detector
//! Mission: Catch cross-venue price dislocations the moment they open
//! Philosophy: Never trust a single feed. Never alert twice for one spread.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spreadbot_backend::{
    alerts::{sink::drain_logged, LogFailureNotifier, QueueSink},
    catalog::{CatalogService, SubscriptionManager},
    engine::{EngineConfig, OpportunityEngine},
    health::HealthMonitor,
    models::{Config, Venue},
    store::PriceStore,
    venues::{self, VenueAdapter},
};

#[derive(Parser, Debug)]
#[command(name = "spreadbot", about = "Real-time cross-venue price-spread detector")]
struct Cli {
    /// Fetch venue catalogs, print the discovered active set, and exit.
    #[arg(long)]
    catalog_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spreadbot=info,spreadbot_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env().context("loading configuration")?;
    cfg.validate()?;
    info!(venues = ?Venue::ALL, "🚀 spreadbot starting");

    let client = reqwest::Client::builder()
        .timeout(cfg.ws_timeout)
        .user_agent(concat!("spreadbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")?;

    let notifier = Arc::new(LogFailureNotifier::new(cfg.failure_cooldown));
    let adapters = venues::build_adapters(&cfg, &client, notifier);

    for adapter in adapters.values() {
        adapter.start().await?;
    }

    let store = Arc::new(PriceStore::new(
        cfg.history_size,
        cfg.stale_after,
        cfg.drop_after,
    ));
    let catalog = Arc::new(CatalogService::new(adapters.clone(), &cfg));
    catalog.refresh().await.context("initial catalog discovery")?;

    if cli.catalog_only {
        let active = catalog.active();
        for instrument in &active.instruments {
            let venues: Vec<&str> = active
                .venues_for(instrument)
                .iter()
                .map(|v| v.as_str())
                .collect();
            println!("{instrument}  [{}]", venues.join(", "));
        }
        for adapter in adapters.values() {
            adapter.stop().await;
        }
        return Ok(());
    }

    let subs = Arc::new(SubscriptionManager::new(
        adapters.clone(),
        store.clone(),
        catalog.clone(),
    ));
    subs.apply().await.context("initial subscription wiring")?;

    let (alert_sink, alert_rx) = QueueSink::new(cfg.alert_queue_capacity);
    tokio::spawn(drain_logged(alert_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Operator command surface (manual closes) lives behind the out-of-scope
    // control API; the channel is wired so the engine supports it.
    let (_engine_cmd_tx, engine_cmd_rx) = mpsc::channel(16);

    let engine = OpportunityEngine::new(
        store.clone(),
        catalog.clone(),
        alert_sink,
        EngineConfig::from_config(&cfg),
    );
    let engine_status = engine.status_handle();
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone(), engine_cmd_rx));

    let health = HealthMonitor::new(adapters.clone(), subs.clone(), cfg.health_interval);
    let health_status = health.snapshot_handle();
    tokio::spawn(health.run(shutdown_rx.clone()));

    // Price store GC.
    {
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep(chrono::Utc::now());
                        if removed > 0 {
                            info!(removed, "price store swept");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Periodic status heartbeat from the read-only views.
    {
        let store = store.clone();
        let catalog = catalog.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let engine = engine_status.read().clone();
                        let failed_venues = health_status
                            .read()
                            .as_ref()
                            .map(|h| h.failed.len())
                            .unwrap_or(0);
                        info!(
                            price_keys = store.len(),
                            instruments = catalog.snapshot().instruments,
                            active_opportunities = engine.active_count,
                            closed_opportunities = engine.closed_count,
                            failed_venues,
                            "status"
                        );
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");

    // Scans stop scheduling first; the in-flight scan runs to completion
    // before any adapter socket closes.
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "engine task ended abnormally");
    }
    for adapter in adapters.values() {
        adapter.stop().await;
    }

    info!("✅ shutdown complete");
    Ok(())
}
