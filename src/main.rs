//! Soleflip - Sneaker Resale Arbitrage Engine
//!
//! Continuously ingests retail and resale prices, detects fee-adjusted
//! arbitrage opportunities, scores them for demand and risk, and dispatches
//! webhook alerts to users whose criteria match.

mod alerts;
mod api;
mod arbitrage;
mod catalog;
mod config;
mod error;
mod fees;
mod ingest;
mod models;
mod scoring;
mod store;

use anyhow::{Context, Result};
use chrono::Utc;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    alerts::{AlertScheduler, AlertStore, WebhookDispatcher},
    arbitrage::{OpportunityDetector, StaticMarketplaces},
    catalog::{InMemoryCatalog, ProductMatcher},
    config::Config,
    ingest::{HttpSourceFeed, IngestionWorker, WebhookIngestor},
    models::{Brand, EngineEvent, Product},
    scoring::{
        DemandScorer, InMemorySalesHistory, OpportunityEnricher, RiskScorer, SeasonalTable,
    },
    store::PriceStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Soleflip Arbitrage Engine starting");

    let config = Config::from_env().context("Failed to load configuration")?;
    init_metrics(config.metrics_port);

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    // Persistence
    let price_store = Arc::new(PriceStore::new(&config.price_db_path)?);
    let alert_store = Arc::new(AlertStore::new(&config.alert_db_path)?);

    // Catalog + sales history collaborators. Production points these at the
    // catalog and order services; a JSON seed file serves standalone runs.
    let catalog = Arc::new(load_catalog_seed()?);
    let sales_history = Arc::new(InMemorySalesHistory::new());
    info!("📚 Catalog loaded: {} products", catalog.len());

    // Engine event bus (price changes, ingest + dispatch outcomes)
    let (events_tx, _) = broadcast::channel::<EngineEvent>(1024);

    // Shutdown signal fan-out
    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    // Scoring + enrichment
    let matcher = Arc::new(ProductMatcher::new(catalog.clone()));
    let marketplaces = Arc::new(StaticMarketplaces::with_defaults());
    let detector = OpportunityDetector::new(
        price_store.clone(),
        catalog.clone(),
        marketplaces,
    );
    let demand = DemandScorer::new(
        sales_history.clone(),
        price_store.clone(),
        SeasonalTable::sneakers_default(),
    );
    let risk = RiskScorer::new(price_store.clone(), config.clone());
    let enricher = Arc::new(OpportunityEnricher::new(
        detector,
        demand,
        risk,
        catalog.clone(),
        config.demand_lookback_days,
        Duration::from_secs(config.cache_ttl_secs),
    ));
    let _invalidation =
        OpportunityEnricher::spawn_invalidation(enricher.cache_handle(), events_tx.subscribe());

    // Pull workers, one per configured source endpoint
    let mut pull_workers = 0;
    for source_config in &config.sources {
        if source_config.endpoint.is_empty() {
            continue;
        }
        let feed = Arc::new(HttpSourceFeed::new(
            http_client.clone(),
            source_config.endpoint.clone(),
        ));
        let worker = IngestionWorker::new(
            source_config.clone(),
            feed,
            matcher.clone(),
            price_store.clone(),
            events_tx.clone(),
        );
        tokio::spawn(worker.run(shutdown_tx.subscribe()));
        pull_workers += 1;
    }
    if pull_workers == 0 {
        warn!("⚠️  No source endpoints configured; pull ingestion idle (push intake still active)");
    }

    // Push intake (inbound webhooks routed through the API)
    let (ingest_tx, ingest_rx) = mpsc::channel(config.queue_capacity);
    let webhook_ingestor = Arc::new(WebhookIngestor::new(
        matcher.clone(),
        price_store.clone(),
        events_tx.clone(),
    ));
    tokio::spawn(
        webhook_ingestor
            .clone()
            .run(ingest_rx, shutdown_tx.subscribe()),
    );

    // Alert scheduling + dispatch
    let dispatcher = Arc::new(WebhookDispatcher::new(
        http_client.clone(),
        config.webhook_timeout_secs,
        config.webhook_max_retries,
    ));
    let scheduler = Arc::new(AlertScheduler::new(
        alert_store.clone(),
        enricher.clone(),
        dispatcher,
        Duration::from_secs(config.tick_interval_secs),
        config.worker_pool_size,
        config.queue_capacity,
        events_tx.clone(),
        shutdown_tx.clone(),
    ));
    tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));

    // Storage maintenance (history + dispatch-log retention)
    tokio::spawn(storage_maintenance(
        price_store.clone(),
        alert_store.clone(),
        config.history_retention_days,
    ));

    // API server
    let api_state = api::ApiState {
        price_store,
        alert_store,
        enricher,
        scheduler,
        ingest_tx,
    };
    let app = api::router(api_state);
    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    let shutdown_for_serve = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_for_serve.send(());
        })
        .await
        .context("Server error")?;

    // Give the scheduler and workers time to drain in-flight dispatches.
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Soleflip stopped");
    Ok(())
}

async fn storage_maintenance(
    price_store: Arc<PriceStore>,
    alert_store: Arc<AlertStore>,
    retention_days: i64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        match price_store.prune_history_before(cutoff) {
            Ok(deleted) if deleted > 0 => {
                info!("🧹 Pruned {} price history events (retention={}d)", deleted, retention_days);
                let _ = price_store.optimize();
            }
            Ok(_) => {}
            Err(e) => warn!("price history prune failed: {}", e),
        }

        let dispatch_cutoff = Utc::now() - chrono::Duration::days(7);
        if let Err(e) = alert_store.prune_dispatch_log_before(dispatch_cutoff) {
            warn!("dispatch log prune failed: {}", e);
        }
    }
}

/// Seed the in-memory catalog from `CATALOG_SEED_PATH` (JSON with `brands`
/// and `products` arrays). Missing file yields an empty catalog.
fn load_catalog_seed() -> Result<InMemoryCatalog> {
    let catalog = InMemoryCatalog::new();
    let Ok(path) = std::env::var("CATALOG_SEED_PATH") else {
        return Ok(catalog);
    };
    if !Path::new(&path).exists() {
        warn!("CATALOG_SEED_PATH={} does not exist; starting empty", path);
        return Ok(catalog);
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read catalog seed {path}"))?;
    let seed: serde_json::Value =
        serde_json::from_str(&raw).context("Failed to parse catalog seed JSON")?;

    let mut brands = 0usize;
    let mut products = 0usize;
    if let Some(entries) = seed.get("brands").and_then(|v| v.as_array()) {
        for entry in entries {
            if let Ok(brand) = serde_json::from_value::<Brand>(entry.clone()) {
                catalog.insert_brand(brand);
                brands += 1;
            }
        }
    }
    if let Some(entries) = seed.get("products").and_then(|v| v.as_array()) {
        for entry in entries {
            if let Ok(product) = serde_json::from_value::<Product>(entry.clone()) {
                catalog.insert_product(product);
                products += 1;
            }
        }
    }
    info!("📦 Catalog seed loaded: {} brands, {} products", brands, products);
    Ok(catalog)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soleflip_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_metrics(port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("📊 Prometheus metrics exposed on {}", addr),
        Err(e) => warn!("Failed to install metrics exporter: {}", e),
    }
}

fn load_env() {
    let _ = dotenv();
}
