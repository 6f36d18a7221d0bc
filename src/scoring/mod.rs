//! Demand and risk scoring plus opportunity enrichment.

pub mod cache;
pub mod demand;
pub mod enricher;
pub mod risk;

pub use cache::ShardedTtlCache;
pub use demand::{DemandBreakdown, DemandScorer, SeasonalTable, TrendDirection};
pub use enricher::{EnhancedOpportunity, OpportunityEnricher};
pub use risk::{RiskAssessment, RiskLevel, RiskScorer};

use crate::models::{BrandId, ProductId};

/// Historical orders read API (external collaborator): per-product sales
/// counts and shelf life over a lookback window. `None` means the collaborator
/// has no data for the subject, which the scorers treat as imputable.
pub trait SalesHistory: Send + Sync {
    fn sales_count(&self, product_id: ProductId, lookback_days: u32) -> Option<u64>;
    /// Mean days from stock entry to sale for recently sold units.
    fn avg_shelf_life_days(&self, product_id: ProductId, lookback_days: u32) -> Option<f64>;
    /// Brand-wide sales velocity in units/day over the lookback.
    fn brand_velocity(&self, brand_id: BrandId, lookback_days: u32) -> Option<f64>;
    /// Highest brand velocity across the catalog (normalization ceiling).
    fn max_brand_velocity(&self, lookback_days: u32) -> Option<f64>;
}

/// In-memory sales history for tests and single-process deployments.
#[derive(Default)]
pub struct InMemorySalesHistory {
    sales: parking_lot::RwLock<std::collections::HashMap<ProductId, (u64, Option<f64>)>>,
    brands: parking_lot::RwLock<std::collections::HashMap<BrandId, f64>>,
}

impl InMemorySalesHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_product(&self, product_id: ProductId, sales: u64, shelf_life_days: Option<f64>) {
        self.sales
            .write()
            .insert(product_id, (sales, shelf_life_days));
    }

    pub fn set_brand_velocity(&self, brand_id: BrandId, velocity: f64) {
        self.brands.write().insert(brand_id, velocity);
    }
}

impl SalesHistory for InMemorySalesHistory {
    fn sales_count(&self, product_id: ProductId, _lookback_days: u32) -> Option<u64> {
        self.sales.read().get(&product_id).map(|(count, _)| *count)
    }

    fn avg_shelf_life_days(&self, product_id: ProductId, _lookback_days: u32) -> Option<f64> {
        self.sales.read().get(&product_id).and_then(|(_, days)| *days)
    }

    fn brand_velocity(&self, brand_id: BrandId, _lookback_days: u32) -> Option<f64> {
        self.brands.read().get(&brand_id).copied()
    }

    fn max_brand_velocity(&self, _lookback_days: u32) -> Option<f64> {
        let brands = self.brands.read();
        brands
            .values()
            .copied()
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
    }
}
