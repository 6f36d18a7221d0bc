//! Risk assessment.
//!
//! Weighted composite over five components, bucketed LOW/MEDIUM/HIGH.
//! Components above 70 contribute a named risk factor; dominant factors map
//! to one-line recommendations.

use crate::arbitrage::Opportunity;
use crate::config::Config;
use crate::error::EngineResult;
use crate::models::SourceKind;
use crate::store::PriceStore;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::Arc;

const W_DEMAND: f64 = 0.30;
const W_VOLATILITY: f64 = 0.25;
const W_STOCK: f64 = 0.20;
const W_MARGIN: f64 = 0.15;
const W_RELIABILITY: f64 = 0.10;

/// Margin at which the margin component reaches zero risk.
const MARGIN_COMFORT: f64 = 0.5;

/// Stock depth at which the stock component reaches zero risk.
const STOCK_COMFORT: f64 = 10.0;

/// Component score above which a risk factor is recorded.
const FACTOR_THRESHOLD: f64 = 70.0;

/// Volatility window.
const VOLATILITY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            _ => None,
        }
    }

    /// LOW < 33 <= MEDIUM <= 66 < HIGH.
    pub fn bucket(risk_score: f64) -> Self {
        if risk_score < 33.0 {
            RiskLevel::Low
        } else if risk_score <= 66.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

/// Mapped 0-100 risk contribution of each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskComponents {
    pub demand: f64,
    pub volatility: f64,
    pub stock: f64,
    pub margin: f64,
    pub reliability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub bucket: RiskLevel,
    pub components: RiskComponents,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
}

pub struct RiskScorer {
    store: Arc<PriceStore>,
    config: Config,
}

impl RiskScorer {
    pub fn new(store: Arc<PriceStore>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn assess(
        &self,
        opportunity: &Opportunity,
        demand_score: f64,
    ) -> EngineResult<RiskAssessment> {
        let volatility_cov = self.sell_side_volatility(opportunity)?;
        let reliability = self.config.reliability(&opportunity.buy.source);

        Ok(assess_components(
            demand_score,
            volatility_cov * 100.0,
            opportunity.buy.stock_qty,
            opportunity.profit_margin,
            reliability,
            &opportunity.buy.source.to_string(),
        ))
    }

    /// Coefficient of variation of sell-side prices over the last 30 days.
    /// Fewer than three observations reads as no observed movement.
    fn sell_side_volatility(&self, opportunity: &Opportunity) -> EngineResult<f64> {
        let since = Utc::now() - Duration::days(VOLATILITY_DAYS);
        let events = self.store.history_for(opportunity.product_id, since)?;
        let prices: Vec<f64> = events
            .iter()
            .filter(|e| e.source.kind() == SourceKind::Resale)
            .map(|e| e.new_price)
            .collect();

        if prices.len() < 3 {
            return Ok(0.0);
        }
        let mean = prices.iter().copied().mean();
        if mean.abs() < f64::EPSILON {
            return Ok(0.0);
        }
        let std_dev = prices.iter().copied().std_dev();
        Ok(std_dev / mean)
    }
}

/// Pure composite over already-measured component inputs.
pub fn assess_components(
    demand_score: f64,
    volatility_pct: f64,
    stock_qty: Option<u32>,
    profit_margin: f64,
    reliability: f64,
    buy_source: &str,
) -> RiskAssessment {
    let demand = (100.0 - demand_score).clamp(0.0, 100.0);
    let volatility = volatility_pct.clamp(0.0, 100.0);
    // Unknown depth on an in-stock listing is treated as a single unit.
    let qty = stock_qty.unwrap_or(1) as f64;
    let stock = ((STOCK_COMFORT - qty) / STOCK_COMFORT * 100.0).clamp(0.0, 100.0);
    let margin = ((1.0 - profit_margin / MARGIN_COMFORT).clamp(0.0, 1.0)) * 100.0;
    let reliability_risk = (100.0 - reliability).clamp(0.0, 100.0);

    let risk_score = (W_DEMAND * demand
        + W_VOLATILITY * volatility
        + W_STOCK * stock
        + W_MARGIN * margin
        + W_RELIABILITY * reliability_risk)
        .clamp(0.0, 100.0);

    let components = RiskComponents {
        demand,
        volatility,
        stock,
        margin,
        reliability: reliability_risk,
    };

    let mut risk_factors = Vec::new();
    let mut recommendations = Vec::new();

    if demand > FACTOR_THRESHOLD {
        risk_factors.push(format!("weak demand (score {:.0})", demand_score));
        recommendations.push("expect a slow flip; price aggressively".to_string());
    }
    if volatility > FACTOR_THRESHOLD {
        risk_factors.push(format!("high price volatility (CoV {:.0}%)", volatility));
        recommendations.push("monitor price for 48h before buying".to_string());
    }
    if stock > FACTOR_THRESHOLD {
        risk_factors.push(format!("low stock ({:.0} unit{})", qty, if qty == 1.0 { "" } else { "s" }));
        recommendations.push("verify availability with supplier before committing".to_string());
    }
    if margin > FACTOR_THRESHOLD {
        risk_factors.push(format!("thin margin ({:.0}%)", profit_margin * 100.0));
        recommendations.push("margin leaves no room for fee drift; negotiate buy price".to_string());
    }
    if reliability_risk > FACTOR_THRESHOLD {
        risk_factors.push(format!(
            "unreliable source (reliability {:.0}, {})",
            reliability, buy_source
        ));
        recommendations.push("cross-check price on a second source".to_string());
    }

    RiskAssessment {
        risk_score,
        bucket: RiskLevel::bucket(risk_score),
        components,
        risk_factors,
        recommendations,
    }
}
