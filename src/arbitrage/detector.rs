//! Opportunity detection engine.
//!
//! Joins the price store against itself across source kinds: buy where a
//! retailer still sells at list, sell where the resale market pays more,
//! and only count profit that survives marketplace fees.

use crate::catalog::ProductCatalog;
use crate::error::EngineResult;
use crate::fees::{payout_for, Marketplace, Payout};
use crate::models::{PriceRecord, ProductId, SourceId, SourceKind};
use crate::store::PriceStore;
use chrono::Utc;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maps a sell-side source to the marketplace whose fee schedule applies.
pub trait MarketplaceProvider: Send + Sync {
    fn for_source(&self, source: &SourceId) -> Option<Marketplace>;
}

/// Static registry, seeded with a default schedule per resale source and
/// overridable per deployment.
#[derive(Default)]
pub struct StaticMarketplaces {
    by_source: RwLock<HashMap<SourceId, Marketplace>>,
}

impl StaticMarketplaces {
    pub fn with_defaults() -> Self {
        let mut by_source = HashMap::new();
        for source in SourceId::known() {
            if source.kind() == SourceKind::Resale {
                by_source.insert(
                    source.clone(),
                    Marketplace::default_resale(source.as_str()),
                );
            }
        }
        Self {
            by_source: RwLock::new(by_source),
        }
    }

    pub fn insert(&self, source: SourceId, marketplace: Marketplace) {
        self.by_source.write().insert(source, marketplace);
    }
}

impl MarketplaceProvider for StaticMarketplaces {
    fn for_source(&self, source: &SourceId) -> Option<Marketplace> {
        self.by_source.read().get(source).cloned()
    }
}

/// Detection filters.
#[derive(Debug, Clone)]
pub struct OpportunityFilters {
    /// Minimum fee-adjusted margin as a fraction of buy price.
    pub min_profit_margin: f64,
    /// Minimum fee-adjusted profit in currency units.
    pub min_gross_profit: f64,
    pub max_buy_price: Option<f64>,
    /// Buy-side sources to consider; None means all.
    pub source_allowlist: Option<Vec<SourceId>>,
    pub limit: usize,
}

impl Default for OpportunityFilters {
    fn default() -> Self {
        Self {
            min_profit_margin: 0.15,
            min_gross_profit: 10.0,
            max_buy_price: None,
            source_allowlist: None,
            limit: 100,
        }
    }
}

/// A fee-adjusted buy-low/sell-high pair on one product + size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub product_id: ProductId,
    pub product_name: String,
    pub product_sku: String,
    pub brand: String,
    pub buy: PriceRecord,
    pub sell: PriceRecord,
    pub marketplace_id: String,
    pub total_fees: f64,
    pub net_sell: f64,
    pub gross_profit: f64,
    pub profit_margin: f64,
    pub roi: f64,
}

pub struct OpportunityDetector {
    store: Arc<PriceStore>,
    catalog: Arc<dyn ProductCatalog>,
    marketplaces: Arc<dyn MarketplaceProvider>,
}

impl OpportunityDetector {
    pub fn new(
        store: Arc<PriceStore>,
        catalog: Arc<dyn ProductCatalog>,
        marketplaces: Arc<dyn MarketplaceProvider>,
    ) -> Self {
        Self {
            store,
            catalog,
            marketplaces,
        }
    }

    /// Scan the catalog for profitable retail -> resale pairs.
    ///
    /// Full detection over 100k products has to fit inside a scheduler tick;
    /// the single-pass join over `products_with_kinds` plus one `latest` read
    /// per side keeps this linear in the changed-product count.
    pub fn detect(&self, filters: &OpportunityFilters) -> EngineResult<Vec<Opportunity>> {
        let at_time = Utc::now();
        let product_ids = self
            .store
            .products_with_kinds(SourceKind::Retail, SourceKind::Resale)?;

        debug!(candidates = product_ids.len(), "scanning products for opportunities");
        let mut opportunities: Vec<Opportunity> = Vec::new();

        for product_id in product_ids {
            let buys = self.store.latest(product_id, Some(SourceKind::Retail))?;
            let sells = self.store.latest(product_id, Some(SourceKind::Resale))?;

            for buy in &buys {
                if !buy.in_stock || buy.price <= 0.0 {
                    continue;
                }
                if let Some(max) = filters.max_buy_price {
                    if buy.price > max {
                        continue;
                    }
                }
                if let Some(allow) = &filters.source_allowlist {
                    if !allow.contains(&buy.source) {
                        continue;
                    }
                }

                for sell in &sells {
                    if !variant_matches(buy, sell) {
                        continue;
                    }

                    let Some(marketplace) = self.marketplaces.for_source(&sell.source) else {
                        warn!(source = %sell.source, "no fee schedule for sell source");
                        continue;
                    };

                    let payout = match payout_for(&marketplace, sell.price, at_time) {
                        Ok(p) => p,
                        Err(e) => {
                            counter!("soleflip_data_integrity_total", 1);
                            warn!(marketplace = marketplace.id, error = %e, "fee schedule fault");
                            continue;
                        }
                    };

                    if let Some(opp) =
                        self.build_opportunity(product_id, buy, sell, &marketplace, payout, filters)
                    {
                        opportunities.push(opp);
                    }
                }
            }
        }

        // Margin descending; stable (product id, buy source) order on ties.
        opportunities.sort_by(|a, b| {
            b.profit_margin
                .partial_cmp(&a.profit_margin)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.product_id.cmp(&b.product_id))
                .then_with(|| a.buy.source.as_str().cmp(b.buy.source.as_str()))
        });
        opportunities.truncate(filters.limit);

        counter!("soleflip_opportunities_detected_total", opportunities.len() as u64);
        info!("💎 Detected {} opportunities", opportunities.len());
        Ok(opportunities)
    }

    fn build_opportunity(
        &self,
        product_id: ProductId,
        buy: &PriceRecord,
        sell: &PriceRecord,
        marketplace: &Marketplace,
        payout: Payout,
        filters: &OpportunityFilters,
    ) -> Option<Opportunity> {
        let gross_profit = payout.net_payout - buy.price;
        if gross_profit <= 0.0 {
            return None;
        }
        let profit_margin = gross_profit / buy.price;
        if profit_margin < filters.min_profit_margin || gross_profit < filters.min_gross_profit {
            return None;
        }

        let product = self.catalog.product(product_id)?;
        let brand = self
            .catalog
            .brand(product.brand_id)
            .map(|b| b.name)
            .unwrap_or_default();

        Some(Opportunity {
            product_id,
            product_name: product.name,
            product_sku: product.sku,
            brand,
            buy: buy.clone(),
            sell: sell.clone(),
            marketplace_id: marketplace.id.clone(),
            total_fees: payout.total_fees,
            net_sell: payout.net_payout,
            gross_profit,
            profit_margin,
            roi: profit_margin,
        })
    }
}

/// Candidate sides must agree on the standardized size; two records without
/// a size variant compare at product level.
fn variant_matches(buy: &PriceRecord, sell: &PriceRecord) -> bool {
    match (&buy.variant, &sell.variant) {
        (Some(b), Some(s)) => (b.standardized - s.standardized).abs() < f64::EPSILON,
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::fees::{FeeRule, FeeSchedule, FeeType};
    use crate::models::{Brand, PriceRecord, Product, Variant};
    use tempfile::TempDir;

    fn marketplace_9pct_plus_30c() -> Marketplace {
        Marketplace {
            id: "stockx".to_string(),
            name: "StockX".to_string(),
            currency: "EUR".to_string(),
            schedule: FeeSchedule {
                rules: vec![
                    FeeRule::percentage("tx", FeeType::Transaction, 0.09),
                    FeeRule::fixed("handling", FeeType::Custom, 0.30),
                ],
            },
        }
    }

    struct Fixture {
        detector: OpportunityDetector,
        store: Arc<PriceStore>,
        product_id: ProductId,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        catalog.insert_brand(brand);
        let product = Product::new("DD1391-100", "Dunk Low Panda", brand_id, "sneakers");
        let product_id = product.id;
        catalog.insert_product(product);

        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(PriceStore::new(dir.path().join("p.db").to_str().unwrap()).unwrap());

        let marketplaces = Arc::new(StaticMarketplaces::default());
        marketplaces.insert(SourceId::Stockx, marketplace_9pct_plus_30c());

        Fixture {
            detector: OpportunityDetector::new(store.clone(), catalog, marketplaces),
            store,
            product_id,
            _dir: dir,
        }
    }

    fn record(
        product_id: ProductId,
        source: SourceId,
        price: f64,
        in_stock: bool,
        qty: Option<u32>,
    ) -> PriceRecord {
        PriceRecord {
            product_id,
            variant: Some(Variant::new("US 10", 10.0)),
            source,
            supplier: Some("AfewStore".to_string()),
            price,
            currency: "EUR".to_string(),
            in_stock,
            stock_qty: qty,
            external_url: Some("https://example.test/p".to_string()),
            external_id: None,
            observed_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn detects_profitable_pair_after_fees() {
        let f = fixture();
        f.store
            .upsert(&record(f.product_id, SourceId::Awin, 120.0, true, Some(5)))
            .unwrap();
        f.store
            .upsert(&record(f.product_id, SourceId::Stockx, 180.0, true, None))
            .unwrap();

        let filters = OpportunityFilters {
            min_profit_margin: 0.20,
            min_gross_profit: 0.0,
            ..Default::default()
        };
        let opps = f.detector.detect(&filters).unwrap();
        assert_eq!(opps.len(), 1);

        let opp = &opps[0];
        // 180 - (180 * 9% + 0.30) = 163.50
        assert!((opp.net_sell - 163.50).abs() < 1e-9);
        assert!((opp.gross_profit - 43.50).abs() < 1e-9);
        assert!((opp.profit_margin - 0.3625).abs() < 1e-9);
        assert!(opp.sell.price > opp.buy.price + opp.total_fees);
    }

    #[test]
    fn out_of_stock_buy_side_is_excluded() {
        let f = fixture();
        f.store
            .upsert(&record(f.product_id, SourceId::Awin, 120.0, false, Some(0)))
            .unwrap();
        f.store
            .upsert(&record(f.product_id, SourceId::Stockx, 180.0, true, None))
            .unwrap();

        let opps = f.detector.detect(&OpportunityFilters::default()).unwrap();
        assert!(opps.is_empty());
    }

    #[test]
    fn margin_filter_applies_after_fees() {
        let f = fixture();
        f.store
            .upsert(&record(f.product_id, SourceId::Awin, 150.0, true, Some(3)))
            .unwrap();
        // Net sell 163.50 on 150 buy: margin 9% — below a 20% floor.
        f.store
            .upsert(&record(f.product_id, SourceId::Stockx, 180.0, true, None))
            .unwrap();

        let filters = OpportunityFilters {
            min_profit_margin: 0.20,
            min_gross_profit: 0.0,
            ..Default::default()
        };
        assert!(f.detector.detect(&filters).unwrap().is_empty());
    }

    #[test]
    fn mismatched_sizes_do_not_pair() {
        let f = fixture();
        let mut buy = record(f.product_id, SourceId::Awin, 120.0, true, Some(5));
        buy.variant = Some(Variant::new("US 9", 9.0));
        f.store.upsert(&buy).unwrap();
        f.store
            .upsert(&record(f.product_id, SourceId::Stockx, 180.0, true, None))
            .unwrap();

        let filters = OpportunityFilters {
            min_profit_margin: 0.0,
            min_gross_profit: 0.0,
            ..Default::default()
        };
        assert!(f.detector.detect(&filters).unwrap().is_empty());
    }

    #[test]
    fn allowlist_constrains_buy_sources() {
        let f = fixture();
        f.store
            .upsert(&record(f.product_id, SourceId::Awin, 120.0, true, Some(5)))
            .unwrap();
        f.store
            .upsert(&record(f.product_id, SourceId::Stockx, 180.0, true, None))
            .unwrap();

        let filters = OpportunityFilters {
            min_profit_margin: 0.0,
            min_gross_profit: 0.0,
            source_allowlist: Some(vec![SourceId::Webgains]),
            ..Default::default()
        };
        assert!(f.detector.detect(&filters).unwrap().is_empty());
    }

    #[test]
    fn results_are_margin_sorted_and_limited() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        catalog.insert_brand(brand);

        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(PriceStore::new(dir.path().join("p.db").to_str().unwrap()).unwrap());
        let marketplaces = Arc::new(StaticMarketplaces::default());
        marketplaces.insert(SourceId::Stockx, marketplace_9pct_plus_30c());
        let detector = OpportunityDetector::new(store.clone(), catalog.clone(), marketplaces);

        let mut ids = Vec::new();
        for (i, sell_price) in [200.0, 260.0, 300.0].iter().enumerate() {
            let product = Product::new(
                &format!("SKU-{i}"),
                &format!("Shoe {i}"),
                brand_id,
                "sneakers",
            );
            ids.push(product.id);
            catalog.insert_product(product);
            store
                .upsert(&record(ids[i], SourceId::Awin, 120.0, true, Some(2)))
                .unwrap();
            store
                .upsert(&record(ids[i], SourceId::Stockx, *sell_price, true, None))
                .unwrap();
        }

        let filters = OpportunityFilters {
            min_profit_margin: 0.0,
            min_gross_profit: 0.0,
            limit: 2,
            ..Default::default()
        };
        let opps = detector.detect(&filters).unwrap();
        assert_eq!(opps.len(), 2);
        assert!(opps[0].profit_margin >= opps[1].profit_margin);
        assert_eq!(opps[0].product_id, ids[2]);
    }
}
