//! Opportunity enrichment.
//!
//! Orchestrates detector -> demand -> risk -> feasibility and exposes the
//! cached query interface the alert scheduler scans against.

use crate::arbitrage::{Opportunity, OpportunityDetector, OpportunityFilters};
use crate::catalog::ProductCatalog;
use crate::error::EngineResult;
use crate::models::{EngineEvent, ProductId};
use crate::scoring::cache::ShardedTtlCache;
use crate::scoring::demand::{DemandBreakdown, DemandScorer};
use crate::scoring::risk::{RiskAssessment, RiskLevel, RiskScorer};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Detector pool size backing a `top` query before feasibility ranking.
const DETECTION_POOL: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub demand: DemandBreakdown,
    pub risk: RiskAssessment,
    pub feasibility_score: f64,
    pub estimated_days_to_sell: u32,
}

/// Feasibility composite, deterministic from its four inputs.
pub fn feasibility(demand: f64, risk: f64, profit_margin: f64, stock_qty: Option<u32>) -> f64 {
    let margin_points = (profit_margin * 200.0).clamp(0.0, 100.0);
    let stock_points = (stock_qty.unwrap_or(1) as f64 * 10.0).clamp(0.0, 100.0);
    (0.40 * demand + 0.30 * (100.0 - risk) + 0.20 * margin_points + 0.10 * stock_points)
        .clamp(0.0, 100.0)
}

/// Days-to-sell estimate in [1, 90].
pub fn estimated_days_to_sell(demand: f64, risk: f64) -> u32 {
    (90.0 * (1.0 - demand / 100.0) + 5.0 * risk / 100.0)
        .clamp(1.0, 90.0)
        .round() as u32
}

pub struct OpportunityEnricher {
    detector: OpportunityDetector,
    demand: DemandScorer,
    risk: RiskScorer,
    catalog: Arc<dyn ProductCatalog>,
    cache: Arc<ShardedTtlCache<DemandBreakdown>>,
    lookback_days: u32,
}

impl OpportunityEnricher {
    pub fn new(
        detector: OpportunityDetector,
        demand: DemandScorer,
        risk: RiskScorer,
        catalog: Arc<dyn ProductCatalog>,
        lookback_days: u32,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            detector,
            demand,
            risk,
            catalog,
            cache: Arc::new(ShardedTtlCache::new(cache_ttl)),
            lookback_days,
        }
    }

    /// Score a batch of detected opportunities in parallel.
    pub fn enhance(
        &self,
        opportunities: Vec<Opportunity>,
    ) -> EngineResult<Vec<EnhancedOpportunity>> {
        let enhanced = opportunities
            .into_par_iter()
            .map(|opportunity| self.enhance_one(opportunity))
            .collect::<EngineResult<Vec<Option<EnhancedOpportunity>>>>()?;
        Ok(enhanced.into_iter().flatten().collect())
    }

    fn enhance_one(
        &self,
        opportunity: Opportunity,
    ) -> EngineResult<Option<EnhancedOpportunity>> {
        let Some(breakdown) = self.demand_for(opportunity.product_id)? else {
            return Ok(None);
        };
        let risk = self.risk.assess(&opportunity, breakdown.composite)?;
        let feasibility_score = feasibility(
            breakdown.composite,
            risk.risk_score,
            opportunity.profit_margin,
            opportunity.buy.stock_qty,
        );
        let estimated = estimated_days_to_sell(breakdown.composite, risk.risk_score);
        Ok(Some(EnhancedOpportunity {
            opportunity,
            demand: breakdown,
            risk,
            feasibility_score,
            estimated_days_to_sell: estimated,
        }))
    }

    /// Best opportunities by feasibility, bounded by a risk ceiling.
    pub fn top(
        &self,
        limit: usize,
        min_feasibility: f64,
        max_risk: RiskLevel,
    ) -> EngineResult<Vec<EnhancedOpportunity>> {
        let filters = OpportunityFilters {
            min_profit_margin: 0.0,
            min_gross_profit: 0.0,
            max_buy_price: None,
            source_allowlist: None,
            limit: DETECTION_POOL,
        };
        let detected = self.detector.detect(&filters)?;
        let mut enhanced: Vec<EnhancedOpportunity> = self
            .enhance(detected)?
            .into_iter()
            .filter(|e| e.feasibility_score >= min_feasibility && e.risk.bucket <= max_risk)
            .collect();

        enhanced.sort_by(|a, b| {
            b.feasibility_score
                .partial_cmp(&a.feasibility_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        enhanced.truncate(limit);
        Ok(enhanced)
    }

    /// Memoized demand breakdown per (product, lookback).
    fn demand_for(&self, product_id: ProductId) -> EngineResult<Option<DemandBreakdown>> {
        if let Some(hit) = self.cache.get(product_id, self.lookback_days) {
            return Ok(Some(hit));
        }
        let Some(product) = self.catalog.product(product_id) else {
            debug!(product_id = %product_id, "product vanished from catalog, skipping");
            return Ok(None);
        };
        let breakdown = self.demand.score(&product, self.lookback_days)?;
        self.cache
            .insert(product_id, self.lookback_days, breakdown.clone());
        Ok(Some(breakdown))
    }

    pub fn invalidate_product(&self, product_id: ProductId) {
        self.cache.invalidate(product_id);
    }

    pub fn cache_handle(&self) -> Arc<ShardedTtlCache<DemandBreakdown>> {
        self.cache.clone()
    }

    /// Eager cache invalidation on price-change events.
    pub fn spawn_invalidation(
        cache: Arc<ShardedTtlCache<DemandBreakdown>>,
        mut events: broadcast::Receiver<EngineEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::PriceChanged { product_id, .. }) => {
                        cache.invalidate(product_id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "invalidation listener lagged; cache may serve stale entries until TTL");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::StaticMarketplaces;
    use crate::catalog::InMemoryCatalog;
    use crate::config::Config;
    use crate::fees::Marketplace;
    use crate::models::{Brand, PriceRecord, Product, SourceId, Variant};
    use crate::scoring::demand::SeasonalTable;
    use crate::scoring::InMemorySalesHistory;
    use crate::store::PriceStore;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        enricher: OpportunityEnricher,
        history: Arc<InMemorySalesHistory>,
        store: Arc<PriceStore>,
        product_id: ProductId,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        catalog.insert_brand(brand);
        let product = Product::new("SKU-1", "Dunk Low Panda", brand_id, "sneakers");
        let product_id = product.id;
        catalog.insert_product(product);

        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(PriceStore::new(dir.path().join("p.db").to_str().unwrap()).unwrap());
        let history = Arc::new(InMemorySalesHistory::new());

        let marketplaces = Arc::new(StaticMarketplaces::default());
        marketplaces.insert(SourceId::Stockx, Marketplace::default_resale("stockx"));

        let detector =
            OpportunityDetector::new(store.clone(), catalog.clone(), marketplaces);
        let demand = DemandScorer::new(history.clone(), store.clone(), SeasonalTable::new());
        let risk = RiskScorer::new(store.clone(), Config::default());

        Fixture {
            enricher: OpportunityEnricher::new(
                detector,
                demand,
                risk,
                catalog,
                90,
                Duration::from_secs(900),
            ),
            history,
            store,
            product_id,
            _dir: dir,
        }
    }

    fn seed_pair(store: &PriceStore, product_id: ProductId) {
        for (source, price) in [(SourceId::Awin, 120.0), (SourceId::Stockx, 180.0)] {
            store
                .upsert(&PriceRecord {
                    product_id,
                    variant: Some(Variant::new("US 10", 10.0)),
                    source,
                    supplier: Some("AfewStore".to_string()),
                    price,
                    currency: "EUR".to_string(),
                    in_stock: true,
                    stock_qty: Some(5),
                    external_url: None,
                    external_id: None,
                    observed_at: Utc::now(),
                    metadata: None,
                })
                .unwrap();
        }
    }

    #[test]
    fn feasibility_formula() {
        // 0.40*80 + 0.30*(100-20) + 0.20*clamp(0.30*200) + 0.10*clamp(5*10)
        // = 32 + 24 + 12 + 5 = 73
        let f = feasibility(80.0, 20.0, 0.30, Some(5));
        assert!((f - 73.0).abs() < 1e-9);
        assert!(feasibility(100.0, 0.0, 1.0, Some(100)) <= 100.0);
        assert!(feasibility(0.0, 100.0, 0.0, Some(0)) >= 0.0);
    }

    #[test]
    fn days_to_sell_bounds() {
        assert_eq!(estimated_days_to_sell(100.0, 0.0), 1);
        assert_eq!(estimated_days_to_sell(0.0, 100.0), 90);
        // demand 50, risk 50: 45 + 2.5 = 48
        assert_eq!(estimated_days_to_sell(50.0, 50.0), 48);
    }

    #[test]
    fn top_enriches_and_ranks() {
        let f = fixture();
        seed_pair(&f.store, f.product_id);
        f.history.set_product(f.product_id, 90 * 2, Some(10.0));

        let top = f.enricher.top(10, 0.0, RiskLevel::High).unwrap();
        assert_eq!(top.len(), 1);
        let e = &top[0];
        assert!(e.feasibility_score >= 0.0 && e.feasibility_score <= 100.0);
        assert!((1..=90).contains(&e.estimated_days_to_sell));
        assert!(e.demand.composite >= 0.0 && e.demand.composite <= 100.0);
    }

    #[test]
    fn risk_ceiling_filters_out() {
        let f = fixture();
        seed_pair(&f.store, f.product_id);
        // Unknown product data pushes demand to 50; risk lands MEDIUM here.
        let medium_ok = f.enricher.top(10, 0.0, RiskLevel::Medium).unwrap();
        let low_only = f.enricher.top(10, 0.0, RiskLevel::Low).unwrap();
        assert!(medium_ok.len() >= low_only.len());
    }

    #[test]
    fn min_feasibility_filters_out() {
        let f = fixture();
        seed_pair(&f.store, f.product_id);
        let none = f.enricher.top(10, 100.0, RiskLevel::High).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn demand_results_are_memoized() {
        let f = fixture();
        seed_pair(&f.store, f.product_id);

        let first = f.enricher.top(10, 0.0, RiskLevel::High).unwrap();
        // New sales data arrives, but the memoized breakdown still serves.
        f.history.set_product(f.product_id, 90 * 5, Some(2.0));
        let second = f.enricher.top(10, 0.0, RiskLevel::High).unwrap();
        assert_eq!(
            first[0].demand.composite,
            second[0].demand.composite
        );

        // Eager invalidation drops the stale entry.
        f.enricher.invalidate_product(f.product_id);
        let third = f.enricher.top(10, 0.0, RiskLevel::High).unwrap();
        assert!(third[0].demand.composite > second[0].demand.composite);
    }
}
