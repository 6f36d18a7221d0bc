//! Demand scoring.
//!
//! Composite of five weighted components. A component the collaborators
//! cannot answer scores neutral 50 and is flagged `imputed`; its weight
//! still counts, so a fully unknown product lands at exactly 50.

use crate::error::EngineResult;
use crate::models::{Product, SourceKind};
use crate::scoring::SalesHistory;
use crate::store::PriceStore;
use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::sync::Arc;

const W_SALES_FREQUENCY: f64 = 0.40;
const W_PRICE_TREND: f64 = 0.25;
const W_STOCK_TURNOVER: f64 = 0.20;
const W_SEASONALITY: f64 = 0.10;
const W_BRAND_POPULARITY: f64 = 0.05;

/// Sales rate at which the frequency component saturates at 100.
const SALES_SATURATION_PER_DAY: f64 = 5.0;

/// Shelf life at or beyond which turnover scores 0.
const TURNOVER_CAP_DAYS: f64 = 90.0;

/// |slope / mean| per day below which the trend counts as stable.
const STABLE_SLOPE_RATIO: f64 = 0.01;

/// Trend points required before the regression is trusted.
const MIN_TREND_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
        }
    }
}

/// One scored component: the raw measured value (if any), its 0-100 mapping,
/// and whether it was imputed for lack of data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentScore {
    pub raw: Option<f64>,
    pub score: f64,
    pub imputed: bool,
}

impl ComponentScore {
    fn measured(raw: f64, score: f64) -> Self {
        Self {
            raw: Some(raw),
            score: score.clamp(0.0, 100.0),
            imputed: false,
        }
    }

    fn imputed() -> Self {
        Self {
            raw: None,
            score: 50.0,
            imputed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandBreakdown {
    pub composite: f64,
    pub sales_frequency: ComponentScore,
    pub price_trend: ComponentScore,
    pub stock_turnover: ComponentScore,
    pub seasonality: ComponentScore,
    pub brand_popularity: ComponentScore,
    pub sales_per_day: f64,
    pub trend_direction: TrendDirection,
    pub avg_turnover_days: Option<f64>,
}

/// Operator-provided month-of-year demand factors per category.
/// Categories absent from the table are treated as unknown (imputed).
#[derive(Debug, Clone, Default)]
pub struct SeasonalTable {
    tables: HashMap<String, [f64; 12]>,
}

impl SeasonalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: &str, factors: [f64; 12]) -> Self {
        self.tables.insert(category.to_string(), factors);
        self
    }

    /// Holiday-weighted sneaker curve used when the operator configures nothing.
    pub fn sneakers_default() -> Self {
        Self::new().with_category(
            "sneakers",
            [
                55.0, 50.0, 60.0, 65.0, 60.0, 55.0, 50.0, 55.0, 65.0, 70.0, 80.0, 90.0,
            ],
        )
    }

    fn factor(&self, category: &str, month0: usize) -> Option<f64> {
        self.tables.get(category).map(|t| t[month0.min(11)])
    }
}

pub struct DemandScorer {
    history: Arc<dyn SalesHistory>,
    store: Arc<PriceStore>,
    seasonal: SeasonalTable,
}

impl DemandScorer {
    pub fn new(
        history: Arc<dyn SalesHistory>,
        store: Arc<PriceStore>,
        seasonal: SeasonalTable,
    ) -> Self {
        Self {
            history,
            store,
            seasonal,
        }
    }

    pub fn score(&self, product: &Product, lookback_days: u32) -> EngineResult<DemandBreakdown> {
        let sales_frequency = self.sales_frequency(product, lookback_days);
        let (price_trend, trend_direction) = self.price_trend(product, lookback_days)?;
        let stock_turnover = self.stock_turnover(product, lookback_days);
        let seasonality = self.seasonality(product);
        let brand_popularity = self.brand_popularity(product, lookback_days);

        let composite = (W_SALES_FREQUENCY * sales_frequency.score
            + W_PRICE_TREND * price_trend.score
            + W_STOCK_TURNOVER * stock_turnover.score
            + W_SEASONALITY * seasonality.score
            + W_BRAND_POPULARITY * brand_popularity.score)
            .clamp(0.0, 100.0);

        Ok(DemandBreakdown {
            composite,
            sales_per_day: sales_frequency.raw.unwrap_or(0.0),
            trend_direction,
            avg_turnover_days: stock_turnover.raw,
            sales_frequency,
            price_trend,
            stock_turnover,
            seasonality,
            brand_popularity,
        })
    }

    /// Orders/day mapped linearly with saturation at 5 sales/day.
    fn sales_frequency(&self, product: &Product, lookback_days: u32) -> ComponentScore {
        match self.history.sales_count(product.id, lookback_days) {
            Some(count) => {
                let rate = count as f64 / lookback_days.max(1) as f64;
                let score = (rate / SALES_SATURATION_PER_DAY * 100.0).min(100.0);
                ComponentScore::measured(rate, score)
            }
            None => ComponentScore::imputed(),
        }
    }

    /// Least-squares slope of sell-side prices over the lookback.
    fn price_trend(
        &self,
        product: &Product,
        lookback_days: u32,
    ) -> EngineResult<(ComponentScore, TrendDirection)> {
        let since = Utc::now() - Duration::days(lookback_days as i64);
        let events = self.store.history_for(product.id, since)?;

        let points: Vec<(f64, f64)> = events
            .iter()
            .filter(|e| e.source.kind() == SourceKind::Resale)
            .map(|e| {
                let days = (e.recorded_at - since).num_seconds() as f64 / 86_400.0;
                (days, e.new_price)
            })
            .collect();

        if points.len() < MIN_TREND_POINTS {
            return Ok((ComponentScore::imputed(), TrendDirection::Stable));
        }

        let slope = least_squares_slope(&points);
        let mean = points.iter().map(|(_, p)| *p).mean();
        let relative = if mean.abs() > f64::EPSILON {
            slope / mean
        } else {
            0.0
        };

        let direction = if relative.abs() < STABLE_SLOPE_RATIO {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Increasing
        } else {
            TrendDirection::Decreasing
        };

        let score = match direction {
            TrendDirection::Increasing => 100.0,
            TrendDirection::Decreasing => 0.0,
            TrendDirection::Stable => 50.0,
        };

        Ok((ComponentScore::measured(slope, score), direction))
    }

    /// Mean shelf life of sold units; fewer days is better, 90+ scores 0.
    fn stock_turnover(&self, product: &Product, lookback_days: u32) -> ComponentScore {
        match self.history.avg_shelf_life_days(product.id, lookback_days) {
            Some(days) => {
                let capped = days.clamp(0.0, TURNOVER_CAP_DAYS);
                let score = (TURNOVER_CAP_DAYS - capped) / TURNOVER_CAP_DAYS * 100.0;
                ComponentScore::measured(days, score)
            }
            None => ComponentScore::imputed(),
        }
    }

    fn seasonality(&self, product: &Product) -> ComponentScore {
        let month0 = Utc::now().month0() as usize;
        match self.seasonal.factor(&product.category, month0) {
            Some(factor) => ComponentScore::measured(factor, factor),
            None => ComponentScore::imputed(),
        }
    }

    /// Brand velocity normalized against the catalog maximum.
    fn brand_popularity(&self, product: &Product, lookback_days: u32) -> ComponentScore {
        let velocity = self.history.brand_velocity(product.brand_id, lookback_days);
        let ceiling = self.history.max_brand_velocity(lookback_days);
        match (velocity, ceiling) {
            (Some(v), Some(max)) if max > 0.0 => {
                ComponentScore::measured(v, (v / max * 100.0).min(100.0))
            }
            _ => ComponentScore::imputed(),
        }
    }
}

fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| *x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| *y).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in points {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den.abs() < f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Brand, PriceRecord, Product, SourceId};
    use crate::scoring::InMemorySalesHistory;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        scorer: DemandScorer,
        history: Arc<InMemorySalesHistory>,
        store: Arc<PriceStore>,
        product: Product,
        _dir: TempDir,
    }

    fn fixture(seasonal: SeasonalTable) -> Fixture {
        let history = Arc::new(InMemorySalesHistory::new());
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(PriceStore::new(dir.path().join("p.db").to_str().unwrap()).unwrap());
        let brand = Brand::new("Nike");
        let product = Product::new("SKU-1", "Dunk Low", brand.id, "sneakers");
        Fixture {
            scorer: DemandScorer::new(history.clone(), store.clone(), seasonal),
            history,
            store,
            product,
            _dir: dir,
        }
    }

    fn resale_record(product_id: Uuid, price: f64, days_ago: i64) -> PriceRecord {
        PriceRecord {
            product_id,
            variant: None,
            source: SourceId::Stockx,
            supplier: None,
            price,
            currency: "EUR".to_string(),
            in_stock: true,
            stock_qty: None,
            external_url: None,
            external_id: None,
            observed_at: Utc::now() - Duration::days(days_ago),
            metadata: None,
        }
    }

    #[test]
    fn unknown_product_scores_neutral_50() {
        let f = fixture(SeasonalTable::new());
        let breakdown = f.scorer.score(&f.product, 90).unwrap();

        assert_eq!(breakdown.composite, 50.0);
        assert_eq!(breakdown.trend_direction, TrendDirection::Stable);
        for c in [
            &breakdown.sales_frequency,
            &breakdown.price_trend,
            &breakdown.stock_turnover,
            &breakdown.seasonality,
            &breakdown.brand_popularity,
        ] {
            assert!(c.imputed);
            assert_eq!(c.score, 50.0);
        }
    }

    #[test]
    fn sales_frequency_saturates_at_five_per_day() {
        let f = fixture(SeasonalTable::new());
        f.history.set_product(f.product.id, 90 * 10, None); // 10/day
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.sales_frequency.score, 100.0);
        assert_eq!(breakdown.sales_per_day, 10.0);
    }

    #[test]
    fn turnover_caps_at_90_days() {
        let f = fixture(SeasonalTable::new());
        f.history.set_product(f.product.id, 0, Some(120.0));
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.stock_turnover.score, 0.0);

        f.history.set_product(f.product.id, 0, Some(9.0));
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.stock_turnover.score, 90.0);
    }

    #[test]
    fn rising_resale_prices_read_as_increasing() {
        let f = fixture(SeasonalTable::new());
        for (i, price) in [100.0, 110.0, 125.0, 140.0, 150.0].iter().enumerate() {
            f.store
                .upsert(&resale_record(f.product.id, *price, 20 - (i as i64 * 4)))
                .unwrap();
        }
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.trend_direction, TrendDirection::Increasing);
        assert_eq!(breakdown.price_trend.score, 100.0);
    }

    #[test]
    fn flat_resale_prices_read_as_stable() {
        let f = fixture(SeasonalTable::new());
        for (i, price) in [100.0, 100.05, 100.02, 100.08].iter().enumerate() {
            f.store
                .upsert(&resale_record(f.product.id, *price, 15 - (i as i64 * 4)))
                .unwrap();
        }
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.trend_direction, TrendDirection::Stable);
        assert_eq!(breakdown.price_trend.score, 50.0);
    }

    #[test]
    fn brand_popularity_normalizes_to_catalog_max() {
        let f = fixture(SeasonalTable::new());
        f.history.set_brand_velocity(f.product.brand_id, 5.0);
        f.history.set_brand_velocity(Uuid::new_v4(), 10.0);
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert_eq!(breakdown.brand_popularity.score, 50.0);
        assert!(!breakdown.brand_popularity.imputed);
    }

    #[test]
    fn composite_stays_in_bounds() {
        let f = fixture(SeasonalTable::sneakers_default());
        f.history.set_product(f.product.id, 90 * 20, Some(1.0));
        f.history.set_brand_velocity(f.product.brand_id, 50.0);
        let breakdown = f.scorer.score(&f.product, 90).unwrap();
        assert!(breakdown.composite >= 0.0 && breakdown.composite <= 100.0);
    }
}
