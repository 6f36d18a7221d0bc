//! Alert scheduler.
//!
//! Single long-lived coordinator: every tick it selects due alerts, fans
//! them out to a bounded worker pool, scans the enricher, applies per-alert
//! filters, and dispatches webhook notifications. One failing alert never
//! stalls the tick or its siblings.
//!
//! Per-alert lifecycle: idle -> due -> scanning -> dispatching -> idle, with
//! failed branching back to idle.

use crate::alerts::dispatcher::{build_payload, dispatch_key, WebhookDispatcher};
use crate::alerts::store::{AlertDefinition, AlertStore};
use crate::error::EngineError;
use crate::models::EngineEvent;
use crate::scoring::{EnhancedOpportunity, OpportunityEnricher};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Grace period for draining in-flight scans on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A storage outage persisting this long is unrecoverable process-wide.
const STORAGE_OUTAGE_LIMIT: Duration = Duration::from_secs(300);

/// Scan deadline multiplier over the alert's frequency.
const SCAN_DEADLINE_FACTOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Idle,
    Due,
    Scanning,
    Dispatching,
    Failed,
}

pub struct AlertScheduler {
    store: Arc<AlertStore>,
    enricher: Arc<OpportunityEnricher>,
    dispatcher: Arc<WebhookDispatcher>,
    tick_interval: Duration,
    worker_pool_size: usize,
    queue_capacity: usize,
    events: broadcast::Sender<EngineEvent>,
    shutdown_trigger: broadcast::Sender<()>,
    states: Arc<Mutex<HashMap<Uuid, AlertState>>>,
    dropped_jobs: AtomicU64,
    cancelled_scans: AtomicU64,
    storage_failing_since: Mutex<Option<std::time::Instant>>,
}

impl AlertScheduler {
    pub fn new(
        store: Arc<AlertStore>,
        enricher: Arc<OpportunityEnricher>,
        dispatcher: Arc<WebhookDispatcher>,
        tick_interval: Duration,
        worker_pool_size: usize,
        queue_capacity: usize,
        events: broadcast::Sender<EngineEvent>,
        shutdown_trigger: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            enricher,
            dispatcher,
            tick_interval,
            worker_pool_size: worker_pool_size.max(1),
            queue_capacity: queue_capacity.max(1),
            events,
            shutdown_trigger,
            states: Arc::new(Mutex::new(HashMap::new())),
            dropped_jobs: AtomicU64::new(0),
            cancelled_scans: AtomicU64::new(0),
            storage_failing_since: Mutex::new(None),
        }
    }

    /// Per-alert state snapshot for the health surface.
    pub fn states_snapshot(&self) -> HashMap<Uuid, AlertState> {
        self.states.lock().clone()
    }

    pub fn dropped_job_count(&self) -> u64 {
        self.dropped_jobs.load(Ordering::Relaxed)
    }

    fn set_state(&self, alert_id: Uuid, state: AlertState) {
        self.states.lock().insert(alert_id, state);
    }

    /// Run the coordinator until shutdown. Spawns the worker pool, ticks on
    /// the configured interval, and drains in-flight work on exit.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            tick_secs = self.tick_interval.as_secs(),
            workers = self.worker_pool_size,
            queue = self.queue_capacity,
            "⏰ Alert scheduler started"
        );

        let (tx, rx) = mpsc::channel::<AlertDefinition>(self.queue_capacity);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.worker_pool_size);
        for worker_id in 0..self.worker_pool_size {
            let scheduler = self.clone();
            let rx = shared_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(alert) = job else { break };
                    scheduler.process_alert(alert).await;
                }
                debug!(worker_id, "scheduler worker exited");
            }));
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Alert scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(&tx);
                }
            }
        }

        // Stop accepting work; let in-flight scans and webhook POSTs finish.
        drop(tx);
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("scheduler drain timed out; abandoning in-flight scans");
        }
        info!("Alert scheduler stopped");
    }

    /// One tick: enqueue every due alert, deferring on queue overflow.
    fn tick(&self, tx: &mpsc::Sender<AlertDefinition>) {
        let now = Utc::now();
        let due = match self.store.due_alerts(now) {
            Ok(due) => {
                *self.storage_failing_since.lock() = None;
                due
            }
            Err(e) => {
                error!(error = %e, "due-alert selection failed; skipping tick");
                let mut failing = self.storage_failing_since.lock();
                let since = failing.get_or_insert_with(std::time::Instant::now);
                if since.elapsed() >= STORAGE_OUTAGE_LIMIT {
                    error!("persistent storage outage; requesting graceful shutdown");
                    let _ = self.shutdown_trigger.send(());
                }
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        debug!(due = due.len(), "tick selected due alerts");

        for alert in due {
            let alert_id = alert.id;
            self.set_state(alert_id, AlertState::Due);
            match tx.try_send(alert) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Deferred to the next tick.
                    self.dropped_jobs.fetch_add(1, Ordering::Relaxed);
                    counter!("soleflip_scheduler_queue_drops_total", 1);
                    self.set_state(alert_id, AlertState::Idle);
                    warn!(alert_id = %alert_id, "scheduler queue full; alert deferred");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Scan + dispatch for one alert under its deadline. A timed-out scan
    /// leaves `last_scanned_at` unchanged so the alert comes due again.
    async fn process_alert(&self, alert: AlertDefinition) {
        let alert_id = alert.id;
        let deadline = Duration::from_secs(
            (alert.frequency_minutes.max(1) as u64) * 60 * SCAN_DEADLINE_FACTOR as u64,
        );

        match tokio::time::timeout(deadline, self.scan_and_dispatch(alert)).await {
            Ok(()) => {
                // Failed stays visible until the alert next comes due.
                let mut states = self.states.lock();
                if states.get(&alert_id) != Some(&AlertState::Failed) {
                    states.insert(alert_id, AlertState::Idle);
                }
            }
            Err(_) => {
                self.cancelled_scans.fetch_add(1, Ordering::Relaxed);
                counter!("soleflip_scheduler_cancelled_scans_total", 1);
                warn!(alert_id = %alert_id, deadline_secs = deadline.as_secs(), "scan cancelled at deadline");
                self.set_state(alert_id, AlertState::Failed);
            }
        }
    }

    async fn scan_and_dispatch(&self, alert: AlertDefinition) {
        let alert_id = alert.id;
        self.set_state(alert_id, AlertState::Scanning);
        let scan_time = Utc::now();

        let top = match self.enricher.top(
            alert.max_opportunities,
            alert.min_feasibility_score,
            alert.max_risk_level,
        ) {
            Ok(top) => top,
            Err(e) => {
                // Storage faults abort this alert's tick only.
                error!(alert_id = %alert_id, error = %e, "opportunity scan failed");
                self.set_state(alert_id, AlertState::Failed);
                return;
            }
        };

        let matched = apply_alert_filters(&alert, top);

        if matched.is_empty() {
            self.finish_scan(alert_id, scan_time);
            return;
        }

        let key = dispatch_key(&alert, &matched, scan_time);
        let dedupe_window = ChronoDuration::minutes(alert.frequency_minutes as i64 * 2);
        match self
            .store
            .was_recently_dispatched(alert_id, &key, dedupe_window)
        {
            Ok(true) => {
                debug!(alert_id = %alert_id, dispatch_key = %key, "duplicate dispatch suppressed");
                counter!("soleflip_dispatch_dedupe_hits_total", 1);
                self.finish_scan(alert_id, scan_time);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(alert_id = %alert_id, error = %e, "dispatch-log lookup failed");
                self.set_state(alert_id, AlertState::Failed);
                return;
            }
        }

        self.set_state(alert_id, AlertState::Dispatching);
        let payload = build_payload(&alert, &matched, scan_time);

        match self
            .dispatcher
            .dispatch(&alert.webhook_url, &payload, &key)
            .await
        {
            Ok(()) => {
                if let Err(e) = self.store.record_dispatch_key(alert_id, &key) {
                    warn!(alert_id = %alert_id, error = %e, "failed to persist dispatch key");
                }
                if let Err(e) =
                    self.store
                        .record_dispatch_success(alert_id, matched.len(), scan_time)
                {
                    warn!(alert_id = %alert_id, error = %e, "failed to record dispatch success");
                }
                let _ = self.events.send(EngineEvent::AlertDispatched {
                    alert_id,
                    opportunities: matched.len(),
                });
                info!(
                    alert_id = %alert_id,
                    opportunities = matched.len(),
                    "🔔 Alert dispatched"
                );
            }
            Err(e) => {
                self.set_state(alert_id, AlertState::Failed);
                match self.store.record_dispatch_failure(alert_id, &e.short()) {
                    Ok(true) => {
                        warn!(alert_id = %alert_id, "alert deactivated after consecutive failures")
                    }
                    Ok(false) => {}
                    Err(store_err) => {
                        warn!(alert_id = %alert_id, error = %store_err, "failed to record dispatch failure")
                    }
                }
                let _ = self.events.send(EngineEvent::AlertFailed {
                    alert_id,
                    error: e.short(),
                });
            }
        }

        self.finish_scan(alert_id, scan_time);
    }

    fn finish_scan(&self, alert_id: Uuid, scan_time: chrono::DateTime<Utc>) {
        if let Err(e) = self.store.record_scan(alert_id, scan_time) {
            match e {
                EngineError::Storage(_) => {
                    error!(alert_id = %alert_id, error = %e, "failed to record scan time")
                }
                other => warn!(alert_id = %alert_id, error = %other, "failed to record scan time"),
            }
        }
    }
}

/// The alert's own filters, applied after the enricher's feasibility/risk cut.
pub fn apply_alert_filters(
    alert: &AlertDefinition,
    opportunities: Vec<EnhancedOpportunity>,
) -> Vec<EnhancedOpportunity> {
    opportunities
        .into_iter()
        .filter(|e| {
            let o = &e.opportunity;
            if o.profit_margin < alert.min_profit_margin {
                return false;
            }
            if o.gross_profit < alert.min_gross_profit {
                return false;
            }
            if let Some(max) = alert.max_buy_price {
                if o.buy.price > max {
                    return false;
                }
            }
            if let Some(allow) = &alert.source_allowlist {
                if !allow.contains(&o.buy.source) {
                    return false;
                }
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::Opportunity;
    use crate::models::{PriceRecord, SourceId};
    use crate::scoring::demand::{ComponentScore, DemandBreakdown, TrendDirection};
    use crate::scoring::risk::assess_components;

    fn enhanced(margin: f64, buy_price: f64, source: SourceId) -> EnhancedOpportunity {
        let product_id = Uuid::new_v4();
        let record = |source: SourceId, price: f64| PriceRecord {
            product_id,
            variant: None,
            source,
            supplier: None,
            price,
            currency: "EUR".to_string(),
            in_stock: true,
            stock_qty: Some(5),
            external_url: None,
            external_id: None,
            observed_at: Utc::now(),
            metadata: None,
        };
        let neutral = ComponentScore {
            raw: None,
            score: 50.0,
            imputed: true,
        };
        EnhancedOpportunity {
            feasibility_score: 70.0,
            estimated_days_to_sell: 30,
            opportunity: Opportunity {
                product_id,
                product_name: "Shoe".to_string(),
                product_sku: "SKU".to_string(),
                brand: "Nike".to_string(),
                buy: record(source, buy_price),
                sell: record(SourceId::Stockx, buy_price * (1.2 + margin)),
                marketplace_id: "stockx".to_string(),
                total_fees: 10.0,
                net_sell: buy_price * (1.0 + margin),
                gross_profit: buy_price * margin,
                profit_margin: margin,
                roi: margin,
            },
            demand: DemandBreakdown {
                composite: 50.0,
                sales_frequency: neutral.clone(),
                price_trend: neutral.clone(),
                stock_turnover: neutral.clone(),
                seasonality: neutral.clone(),
                brand_popularity: neutral,
                sales_per_day: 0.0,
                trend_direction: TrendDirection::Stable,
                avg_turnover_days: None,
            },
            risk: assess_components(50.0, 10.0, Some(5), margin, 85.0, "awin"),
        }
    }

    #[test]
    fn filters_apply_margin_gross_price_and_allowlist() {
        let mut alert = AlertDefinition::new(Uuid::new_v4(), "a", "https://hook.test/a");
        alert.min_profit_margin = 0.25;
        alert.min_gross_profit = 20.0;
        alert.max_buy_price = Some(150.0);
        alert.source_allowlist = Some(vec![SourceId::Awin]);

        let candidates = vec![
            enhanced(0.30, 120.0, SourceId::Awin),     // passes everything
            enhanced(0.10, 120.0, SourceId::Awin),     // margin too thin
            enhanced(0.30, 400.0, SourceId::Awin),     // too expensive
            enhanced(0.30, 120.0, SourceId::Webgains), // wrong source
        ];
        let matched = apply_alert_filters(&alert, candidates);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].opportunity.buy.price, 120.0);
    }

    #[test]
    fn gross_profit_floor_applies() {
        let mut alert = AlertDefinition::new(Uuid::new_v4(), "a", "https://hook.test/a");
        alert.min_profit_margin = 0.0;
        alert.min_gross_profit = 50.0;

        // 30% of 120 = 36 gross: below the floor.
        let matched = apply_alert_filters(&alert, vec![enhanced(0.30, 120.0, SourceId::Awin)]);
        assert!(matched.is_empty());
    }
}
