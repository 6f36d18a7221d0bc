//! Ingestion workers.
//!
//! One worker per source: pull workers poll an upstream feed on an interval
//! behind a per-source token bucket; the webhook ingestor consumes pushed
//! events off a bounded channel with a 24-hour dedupe window. Both funnel
//! rows through the matcher into the price store. A failing source never
//! takes a sibling down.

use crate::catalog::ProductMatcher;
use crate::config::SourceConfig;
use crate::error::{EngineError, EngineResult};
use crate::ingest::backoff::BackoffPolicy;
use crate::ingest::normalize::{normalize_payload, parse_size};
use crate::ingest::rate_limit::TokenBucket;
use crate::models::{EngineEvent, PriceRecord, RawPriceRow, SourceId};
use crate::store::PriceStore;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Consecutive failures before a source is taken out of rotation.
const FAILURE_THRESHOLD: u32 = 5;

/// Webhook dedupe window.
const DEDUPE_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Upstream feed seam; one implementation per transport.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    async fn fetch(&self) -> EngineResult<Value>;
}

/// HTTP pull feed. Classifies responses per the error taxonomy and honors
/// Retry-After on 429.
pub struct HttpSourceFeed {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSourceFeed {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl SourceFeed for HttpSourceFeed {
    async fn fetch(&self) -> EngineResult<Value> {
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(EngineError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::from_status(status.as_u16(), body, retry_after));
        }

        resp.json::<Value>().await.map_err(EngineError::from)
    }
}

/// Per-source health tracking; trips after consecutive failures so a dead
/// upstream stops burning its rate budget.
struct SourceHealth {
    consecutive_failures: u32,
    tripped: bool,
}

impl SourceHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            tripped: false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, source: &SourceId, reason: &str) {
        self.consecutive_failures += 1;
        warn!(
            source = %source,
            failures = self.consecutive_failures,
            reason,
            "⚠️ Source failure recorded"
        );
        if self.consecutive_failures >= FAILURE_THRESHOLD && !self.tripped {
            self.tripped = true;
            error!(source = %source, "🛑 Source kill-switch engaged");
        }
    }

    fn is_active(&self) -> bool {
        !self.tripped
    }
}

/// Outcome of one batch of rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub accepted: usize,
    pub changed: usize,
    pub unmatched: usize,
    pub rejected: usize,
}

/// Pull-loop worker for one source.
pub struct IngestionWorker {
    config: SourceConfig,
    feed: Arc<dyn SourceFeed>,
    matcher: Arc<ProductMatcher>,
    store: Arc<PriceStore>,
    events: broadcast::Sender<EngineEvent>,
    bucket: TokenBucket,
    backoff: BackoffPolicy,
    health: SourceHealth,
}

impl IngestionWorker {
    pub fn new(
        config: SourceConfig,
        feed: Arc<dyn SourceFeed>,
        matcher: Arc<ProductMatcher>,
        store: Arc<PriceStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let bucket = TokenBucket::new(config.rate_per_second, config.burst);
        Self {
            config,
            feed,
            matcher,
            store,
            events,
            bucket,
            backoff: BackoffPolicy::default(),
            health: SourceHealth::new(),
        }
    }

    /// Long-lived pull loop; exits on shutdown signal.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let source = self.config.id.clone();
        info!(
            source = %source,
            interval_secs = self.config.poll_interval_secs,
            "📡 Ingestion worker started"
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(source = %source, "Ingestion worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.health.is_active() {
                        continue;
                    }
                    self.poll_once().await;
                }
            }
        }
    }

    /// One poll cycle: rate-limit, fetch with retry, normalize, ingest.
    pub async fn poll_once(&mut self) -> IngestStats {
        let source = self.config.id.clone();
        self.bucket.acquire().await;

        let feed = self.feed.clone();
        let payload = self
            .backoff
            .retry(source.as_str(), || {
                let feed = feed.clone();
                async move { feed.fetch().await }
            })
            .await;

        match payload {
            Ok(payload) => {
                let rows = normalize_payload(&source, &payload);
                let stats = ingest_rows(&self.matcher, &self.store, &self.events, &source, rows);
                self.health.record_success();
                debug!(
                    source = %source,
                    accepted = stats.accepted,
                    changed = stats.changed,
                    unmatched = stats.unmatched,
                    rejected = stats.rejected,
                    "poll cycle done"
                );
                let _ = self.events.send(EngineEvent::RowsIngested {
                    source: source.clone(),
                    accepted: stats.accepted,
                    rejected: stats.rejected + stats.unmatched,
                });
                stats
            }
            Err(e) => {
                counter!("soleflip_source_failures_total", 1, "source" => source.as_str().to_string());
                self.health.record_failure(&source, &e.short());
                IngestStats::default()
            }
        }
    }
}

/// Funnel a batch of raw rows through the matcher into the price store.
/// Per-row failures are isolated; storage errors are retried once.
pub fn ingest_rows(
    matcher: &ProductMatcher,
    store: &PriceStore,
    events: &broadcast::Sender<EngineEvent>,
    source: &SourceId,
    rows: Vec<RawPriceRow>,
) -> IngestStats {
    let mut stats = IngestStats::default();

    for row in rows {
        let product_id = match matcher.match_row(&row) {
            Ok(Some(id)) => id,
            Ok(None) => {
                stats.unmatched += 1;
                counter!("soleflip_rows_unmatched_total", 1, "source" => source.as_str().to_string());
                continue;
            }
            Err(e) => {
                stats.rejected += 1;
                counter!("soleflip_data_integrity_total", 1);
                warn!(source = %source, error = %e, "row skipped by matcher");
                continue;
            }
        };

        let record = PriceRecord {
            product_id,
            variant: row.size.as_deref().and_then(parse_size),
            source: source.clone(),
            supplier: row.supplier.clone(),
            price: row.price,
            currency: row.currency.clone(),
            in_stock: row.in_stock,
            stock_qty: row.stock_qty,
            external_url: row.url.clone(),
            external_id: row.external_id.clone(),
            observed_at: row.observed_at.unwrap_or_else(Utc::now),
            metadata: row.extra.clone(),
        };

        let mut outcome = store.upsert(&record);
        if matches!(outcome, Err(EngineError::Storage(_))) {
            outcome = store.upsert(&record);
        }

        match outcome {
            Ok(result) => {
                stats.accepted += 1;
                counter!("soleflip_rows_ingested_total", 1, "source" => source.as_str().to_string());
                if result.changed {
                    stats.changed += 1;
                    if let Some(event) = result.event {
                        let _ = events.send(EngineEvent::PriceChanged {
                            product_id: event.product_id,
                            source: event.source,
                            old_price: event.old_price,
                            new_price: event.new_price,
                        });
                    }
                }
            }
            Err(EngineError::DataIntegrity(msg)) => {
                stats.rejected += 1;
                counter!("soleflip_data_integrity_total", 1);
                warn!(source = %source, reason = %msg, "row rejected by price store");
            }
            Err(e) => {
                stats.rejected += 1;
                error!(source = %source, error = %e, "price store write failed");
            }
        }
    }

    stats
}

/// Sliding-window dedupe for pushed events, keyed by the event's externally
/// assigned id plus its observation time.
struct DedupeWindow {
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
    window: Duration,
}

impl DedupeWindow {
    fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            window,
        }
    }

    /// True when the key was already seen inside the window.
    fn check_and_insert(&mut self, key: String) -> bool {
        let now = Instant::now();
        while let Some((at, _)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            if let Some((_, expired)) = self.order.pop_front() {
                self.seen.remove(&expired);
            }
        }

        if self.seen.contains_key(&key) {
            return true;
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((now, key));
        false
    }
}

/// Consumes pushed source events (inbound webhooks) off a bounded channel.
pub struct WebhookIngestor {
    matcher: Arc<ProductMatcher>,
    store: Arc<PriceStore>,
    events: broadcast::Sender<EngineEvent>,
    seen: Mutex<DedupeWindow>,
}

impl WebhookIngestor {
    pub fn new(
        matcher: Arc<ProductMatcher>,
        store: Arc<PriceStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            matcher,
            store,
            events,
            seen: Mutex::new(DedupeWindow::new(DEDUPE_WINDOW)),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(SourceId, Value)>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("📥 Webhook ingestor started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = rx.recv() => {
                    let Some((source, payload)) = event else { break };
                    self.handle_event(&source, &payload);
                }
            }
        }
        info!("Webhook ingestor stopped");
    }

    /// Normalize, dedupe and ingest one pushed payload.
    pub fn handle_event(&self, source: &SourceId, payload: &Value) -> IngestStats {
        let rows = normalize_payload(source, payload);
        let mut fresh = Vec::with_capacity(rows.len());
        {
            let mut seen = self.seen.lock();
            for row in rows {
                let Some(external_id) = &row.external_id else {
                    // Rows without an external id cannot be deduped; pass through.
                    fresh.push(row);
                    continue;
                };
                let observed = row
                    .observed_at
                    .map(|t| t.timestamp_millis())
                    .unwrap_or_default();
                let key = format!("{}|{}|{}", source, external_id, observed);
                if seen.check_and_insert(key) {
                    counter!("soleflip_webhook_duplicates_total", 1);
                    continue;
                }
                fresh.push(row);
            }
        }

        let stats = ingest_rows(&self.matcher, &self.store, &self.events, source, fresh);
        let _ = self.events.send(EngineEvent::RowsIngested {
            source: source.clone(),
            accepted: stats.accepted,
            rejected: stats.rejected + stats.unmatched,
        });
        stats
    }
}
