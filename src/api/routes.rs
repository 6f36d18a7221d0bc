//! API routes.
//!
//! Health and query endpoints only; the CRUD surface for products, users
//! and alert definitions lives in a separate service. POST /ingest/:source
//! is the intake for sources that push instead of being polled.

use crate::alerts::{AlertScheduler, AlertStore};
use crate::models::SourceId;
use crate::scoring::{OpportunityEnricher, RiskLevel};
use crate::store::PriceStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub price_store: Arc<PriceStore>,
    pub alert_store: Arc<AlertStore>,
    pub enricher: Arc<OpportunityEnricher>,
    pub scheduler: Arc<AlertScheduler>,
    pub ingest_tx: mpsc::Sender<(SourceId, Value)>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/opportunities", get(get_opportunities))
        .route("/api/alerts/stats", get(get_alert_stats))
        .route("/ingest/:source", post(post_ingest))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "price_records": state.price_store.record_count(),
        "price_history_events": state.price_store.history_count(),
        "scheduler": {
            "dropped_jobs": state.scheduler.dropped_job_count(),
            "alert_states": state.scheduler.states_snapshot()
                .into_iter()
                .map(|(id, s)| (id.to_string(), s))
                .collect::<std::collections::HashMap<_, _>>(),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct OpportunityQuery {
    limit: Option<usize>,
    min_feasibility: Option<f64>,
    max_risk: Option<String>,
}

async fn get_opportunities(
    State(state): State<ApiState>,
    Query(query): Query<OpportunityQuery>,
) -> impl IntoResponse {
    let max_risk = query
        .max_risk
        .as_deref()
        .and_then(RiskLevel::parse)
        .unwrap_or(RiskLevel::High);

    match state.enricher.top(
        query.limit.unwrap_or(50),
        query.min_feasibility.unwrap_or(0.0),
        max_risk,
    ) {
        Ok(opportunities) => Json(json!({
            "count": opportunities.len(),
            "opportunities": opportunities,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_alert_stats(State(state): State<ApiState>) -> impl IntoResponse {
    match state.alert_store.list_all() {
        Ok(alerts) => {
            let stats: Vec<Value> = alerts
                .iter()
                .map(|a| {
                    json!({
                        "id": a.id.to_string(),
                        "name": a.name,
                        "active": a.active,
                        "total_alerts_sent": a.total_alerts_sent,
                        "total_opportunities_sent": a.total_opportunities_sent,
                        "total_failed_deliveries": a.total_failed_deliveries,
                        "last_scanned_at": a.last_scanned_at.map(|t| t.to_rfc3339()),
                        "last_triggered_at": a.last_triggered_at.map(|t| t.to_rfc3339()),
                        "last_error": a.last_error,
                    })
                })
                .collect();
            Json(json!({ "alerts": stats })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Inbound push intake for webhook-style sources. Payloads are queued for
/// the webhook ingestor; a full queue sheds load instead of blocking.
async fn post_ingest(
    State(state): State<ApiState>,
    Path(source): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let source = SourceId::parse(&source);
    match state.ingest_tx.try_send((source, payload)) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "ingest queue full" })),
        )
            .into_response(),
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "ingest unavailable" })),
        )
            .into_response(),
    }
}
