//! Webhook delivery.
//!
//! The only wire format the engine emits: a JSON notification POSTed to the
//! user's webhook with an idempotency key header. 5xx and network errors are
//! retried on a 1/4/16 s ladder; 4xx fails the delivery permanently.

use crate::alerts::store::AlertDefinition;
use crate::error::{EngineError, EngineResult};
use crate::ingest::BackoffPolicy;
use crate::scoring::EnhancedOpportunity;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

/// Deterministic idempotency token per (alert, product set, time bucket).
pub fn dispatch_key(alert: &AlertDefinition, opportunities: &[EnhancedOpportunity], now: DateTime<Utc>) -> String {
    let mut product_ids: Vec<String> = opportunities
        .iter()
        .map(|o| o.opportunity.product_id.to_string())
        .collect();
    product_ids.sort();
    product_ids.dedup();

    let bucket = now.timestamp() / (alert.frequency_minutes.max(1) as i64 * 60);

    let mut hasher = Sha256::new();
    hasher.update(alert.id.as_bytes());
    for id in &product_ids {
        hasher.update(id.as_bytes());
    }
    hasher.update(bucket.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Notification payload for one alert hit.
pub fn build_payload(
    alert: &AlertDefinition,
    opportunities: &[EnhancedOpportunity],
    now: DateTime<Utc>,
) -> Value {
    let entries: Vec<Value> = opportunities
        .iter()
        .map(|e| {
            let o = &e.opportunity;
            json!({
                "product_name": o.product_name,
                "product_sku": o.product_sku,
                "brand": o.brand,
                "buy_price": o.buy.price,
                "sell_price": o.sell.price,
                "gross_profit": o.gross_profit,
                "profit_margin": o.profit_margin,
                "roi": o.roi,
                "buy_source": o.buy.source.as_str(),
                "buy_supplier": o.buy.supplier.clone().unwrap_or_default(),
                "buy_url": o.buy.external_url.clone().unwrap_or_default(),
                "stock_qty": o.buy.stock_qty.unwrap_or(0),
                "feasibility_score": e.feasibility_score.round() as i64,
                "demand_score": e.demand.composite,
                "risk_level": e.risk.bucket.as_str(),
                "estimated_days_to_sell": e.estimated_days_to_sell,
                "demand_breakdown": serde_json::to_value(&e.demand).unwrap_or(Value::Null),
                "risk_details": serde_json::to_value(&e.risk).unwrap_or(Value::Null),
            })
        })
        .collect();

    let total = opportunities.len();
    let avg = |f: &dyn Fn(&EnhancedOpportunity) -> f64| {
        if total == 0 {
            0.0
        } else {
            opportunities.iter().map(|e| f(e)).sum::<f64>() / total as f64
        }
    };

    json!({
        "alert": {
            "id": alert.id.to_string(),
            "name": alert.name,
            "user_id": alert.user_id.to_string(),
        },
        "notification_config": alert.notification_config,
        "opportunities": entries,
        "summary": {
            "total_opportunities": total,
            "avg_profit_margin": avg(&|e| e.opportunity.profit_margin),
            "avg_feasibility": avg(&|e| e.feasibility_score),
            "total_potential_profit": opportunities
                .iter()
                .map(|e| e.opportunity.gross_profit)
                .sum::<f64>(),
        },
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl WebhookDispatcher {
    pub fn new(client: reqwest::Client, timeout_secs: u64, max_retries: u32) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(timeout_secs),
            backoff: BackoffPolicy::webhook(max_retries),
        }
    }

    /// POST the payload, retrying transient failures. At-least-once: the
    /// receiver dedupes on the `X-Dispatch-Key` header.
    pub async fn dispatch(
        &self,
        webhook_url: &str,
        payload: &Value,
        dispatch_key: &str,
    ) -> EngineResult<()> {
        let result = self
            .backoff
            .retry("webhook", || async {
                let resp = self
                    .client
                    .post(webhook_url)
                    .timeout(self.timeout)
                    .header("X-Dispatch-Key", dispatch_key)
                    .json(payload)
                    .send()
                    .await
                    .map_err(EngineError::from)?;

                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = resp.text().await.unwrap_or_default();
                Err(EngineError::from_status(status.as_u16(), body, retry_after))
            })
            .await;

        match &result {
            Ok(()) => {
                counter!("soleflip_webhook_deliveries_total", 1);
                debug!(dispatch_key, "webhook delivered");
            }
            Err(e) => {
                counter!("soleflip_webhook_failures_total", 1);
                warn!(dispatch_key, error = %e, "webhook delivery failed");
            }
        }
        result
    }
}
