//! Shared domain types for the arbitrage pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProductId = Uuid;
pub type BrandId = Uuid;
pub type VariantId = Uuid;

/// Economic role of a price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Retail,
    Resale,
    Auction,
    Wholesale,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Retail => "retail",
            SourceKind::Resale => "resale",
            SourceKind::Auction => "auction",
            SourceKind::Wholesale => "wholesale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retail" => Some(SourceKind::Retail),
            "resale" => Some(SourceKind::Resale),
            "auction" => Some(SourceKind::Auction),
            "wholesale" => Some(SourceKind::Wholesale),
            _ => None,
        }
    }
}

/// Origin of a price record. Orthogonal to the marketplace a sale would
/// execute on: a StockX record is a resale-kind observation whose payout is
/// computed by the stockx fee schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Stockx,
    Awin,
    Webgains,
    Ebay,
    Goat,
    Klekt,
    Restocks,
    Other(String),
}

impl SourceId {
    pub fn as_str(&self) -> &str {
        match self {
            SourceId::Stockx => "stockx",
            SourceId::Awin => "awin",
            SourceId::Webgains => "webgains",
            SourceId::Ebay => "ebay",
            SourceId::Goat => "goat",
            SourceId::Klekt => "klekt",
            SourceId::Restocks => "restocks",
            SourceId::Other(name) => name.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stockx" => SourceId::Stockx,
            "awin" => SourceId::Awin,
            "webgains" => SourceId::Webgains,
            "ebay" => SourceId::Ebay,
            "goat" => SourceId::Goat,
            "klekt" => SourceId::Klekt,
            "restocks" => SourceId::Restocks,
            other => SourceId::Other(other.to_string()),
        }
    }

    /// Economic role of the source.
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceId::Awin | SourceId::Webgains => SourceKind::Retail,
            SourceId::Stockx | SourceId::Goat | SourceId::Klekt | SourceId::Restocks => {
                SourceKind::Resale
            }
            SourceId::Ebay => SourceKind::Auction,
            SourceId::Other(_) => SourceKind::Retail,
        }
    }

    /// Deployment-default reliability score [0,100]. Overridable per source
    /// via `SOURCE_<NAME>_RELIABILITY`.
    pub fn default_reliability(&self) -> f64 {
        match self {
            SourceId::Stockx => 95.0,
            SourceId::Goat => 90.0,
            SourceId::Awin => 85.0,
            SourceId::Webgains => 80.0,
            SourceId::Klekt => 80.0,
            SourceId::Restocks => 75.0,
            SourceId::Ebay => 70.0,
            SourceId::Other(_) => 60.0,
        }
    }

    /// Known source ids (used to enumerate per-source env configuration).
    pub fn known() -> &'static [SourceId] {
        &[
            SourceId::Stockx,
            SourceId::Awin,
            SourceId::Webgains,
            SourceId::Ebay,
            SourceId::Goat,
            SourceId::Klekt,
            SourceId::Restocks,
        ]
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Brand with alternate-name patterns for cross-source matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brand {
    pub id: BrandId,
    pub name: String,
    pub aliases: Vec<String>,
}

impl Brand {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Canonical folded form: lowercase, whitespace collapsed.
    pub fn folded_name(&self) -> String {
        fold_name(&self.name)
    }

    /// True when `candidate` matches the canonical name or any alias after folding.
    pub fn matches(&self, candidate: &str) -> bool {
        let folded = fold_name(candidate);
        if folded == self.folded_name() {
            return true;
        }
        self.aliases.iter().any(|a| fold_name(a) == folded)
    }
}

/// Case/whitespace folding shared by brand and product-name matching.
pub fn fold_name(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Size variant with a locale-independent standardized value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    /// Human value, e.g. "US 10".
    pub value: String,
    /// Standardized numeric equivalent for matching across locales.
    pub standardized: f64,
}

impl Variant {
    pub fn new(value: &str, standardized: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.to_string(),
            standardized,
        }
    }
}

/// Catalog product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub ean: Option<String>,
    pub gtin: Option<String>,
    pub style_code: Option<String>,
    pub stockx_product_id: Option<String>,
    pub brand_id: BrandId,
    pub category: String,
    pub retail_price: Option<f64>,
    /// Opaque enrichment blob carried through, never interpreted by the core.
    pub enrichment: Option<serde_json::Value>,
    pub last_enriched_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Product {
    pub fn new(sku: &str, name: &str, brand_id: BrandId, category: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: name.to_string(),
            ean: None,
            gtin: None,
            style_code: None,
            stockx_product_id: None,
            brand_id,
            category: category.to_string(),
            retail_price: None,
            enrichment: None,
            last_enriched_at: None,
            active: true,
        }
    }

    pub fn with_style_code(mut self, style_code: &str) -> Self {
        self.style_code = Some(style_code.to_string());
        self
    }

    pub fn with_ean(mut self, ean: &str) -> Self {
        self.ean = Some(ean.to_string());
        self
    }

    pub fn with_gtin(mut self, gtin: &str) -> Self {
        self.gtin = Some(gtin.to_string());
        self
    }

    pub fn with_stockx_id(mut self, id: &str) -> Self {
        self.stockx_product_id = Some(id.to_string());
        self
    }

    pub fn with_retail_price(mut self, price: f64) -> Self {
        self.retail_price = Some(price);
        self
    }
}

/// A raw row as delivered by a source feed, before catalog matching.
/// Unknown upstream fields are stashed in `extra` and carried through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPriceRow {
    /// Externally assigned record id (dedupe key together with source + observed_at).
    pub external_id: Option<String>,
    pub ean: Option<String>,
    pub gtin: Option<String>,
    pub style_code: Option<String>,
    pub platform_product_id: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub size: Option<String>,
    pub price: f64,
    pub currency: String,
    pub in_stock: bool,
    pub stock_qty: Option<u32>,
    pub supplier: Option<String>,
    pub url: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

/// Normalized price observation, the single shape every source feeds into
/// the price store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub product_id: ProductId,
    pub variant: Option<Variant>,
    pub source: SourceId,
    pub supplier: Option<String>,
    pub price: f64,
    pub currency: String,
    pub in_stock: bool,
    pub stock_qty: Option<u32>,
    pub external_url: Option<String>,
    pub external_id: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Opaque per-source metadata blob, never interpreted by the core.
    pub metadata: Option<serde_json::Value>,
}

/// Append-only audit event emitted when a stored price moves by more than
/// epsilon or stock availability flips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistoryEvent {
    pub id: i64,
    pub product_id: ProductId,
    pub variant_standardized: Option<f64>,
    pub source: SourceId,
    pub old_price: Option<f64>,
    pub new_price: f64,
    pub old_in_stock: Option<bool>,
    pub new_in_stock: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Engine-internal event bus payloads (ingestion + dispatch outcomes).
/// The API layer consumes these for health snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PriceChanged {
        product_id: ProductId,
        source: SourceId,
        old_price: Option<f64>,
        new_price: f64,
    },
    RowsIngested {
        source: SourceId,
        accepted: usize,
        rejected: usize,
    },
    AlertDispatched {
        alert_id: Uuid,
        opportunities: usize,
    },
    AlertFailed {
        alert_id: Uuid,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_mapping() {
        assert_eq!(SourceId::Awin.kind(), SourceKind::Retail);
        assert_eq!(SourceId::Stockx.kind(), SourceKind::Resale);
        assert_eq!(SourceId::Ebay.kind(), SourceKind::Auction);
    }

    #[test]
    fn source_id_roundtrip() {
        for s in SourceId::known() {
            assert_eq!(&SourceId::parse(s.as_str()), s);
        }
        assert_eq!(
            SourceId::parse("kickz"),
            SourceId::Other("kickz".to_string())
        );
    }

    #[test]
    fn brand_alias_matching() {
        let brand = Brand::new("Nike").with_aliases(&["NIKE Inc.", "nike sportswear"]);
        assert!(brand.matches("nike"));
        assert!(brand.matches("  NIKE   Sportswear "));
        assert!(!brand.matches("adidas"));
    }

    #[test]
    fn fold_name_collapses_whitespace() {
        assert_eq!(fold_name("  Air   JORDAN  1 "), "air jordan 1");
    }
}
