//! Cross-source product matching.
//!
//! Deterministic lookup ladder, first hit wins: platform id, EAN, GTIN,
//! style code, then a fuzzy name+brand fallback. A non-fuzzy hit always
//! beats fuzzy. Duplicate stable ids are a data fault, not a tiebreak.

use crate::catalog::store::ProductCatalog;
use crate::error::{EngineError, EngineResult};
use crate::models::{fold_name, Product, ProductId, RawPriceRow};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum token-set Jaccard similarity for a fuzzy name match.
const FUZZY_THRESHOLD: f64 = 0.85;

pub struct ProductMatcher {
    catalog: Arc<dyn ProductCatalog>,
}

impl ProductMatcher {
    pub fn new(catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { catalog }
    }

    /// Best-matching product for a raw source row, or None.
    ///
    /// `fails with DataIntegrity` when a stable identifier maps to more than
    /// one product; the offending row is skipped by callers.
    pub fn match_row(&self, row: &RawPriceRow) -> EngineResult<Option<ProductId>> {
        if let Some(id) = &row.platform_product_id {
            if let Some(hit) = self.unique_hit("stockx_product_id", id, self.catalog.by_stockx_id(id))? {
                return Ok(Some(hit));
            }
        }
        if let Some(ean) = &row.ean {
            if let Some(hit) = self.unique_hit("ean", ean, self.catalog.by_ean(ean))? {
                return Ok(Some(hit));
            }
        }
        if let Some(gtin) = &row.gtin {
            if let Some(hit) = self.unique_hit("gtin", gtin, self.catalog.by_gtin(gtin))? {
                return Ok(Some(hit));
            }
        }
        if let Some(code) = &row.style_code {
            if let Some(hit) = self.unique_hit("style_code", code, self.catalog.by_style_code(code))? {
                return Ok(Some(hit));
            }
        }

        Ok(self.fuzzy_match(row))
    }

    fn unique_hit(
        &self,
        field: &str,
        value: &str,
        hits: Vec<Product>,
    ) -> EngineResult<Option<ProductId>> {
        match hits.len() {
            0 => Ok(None),
            1 => Ok(Some(hits[0].id)),
            n => {
                warn!(field, value, products = n, "duplicate stable identifier in catalog");
                Err(EngineError::DataIntegrity(format!(
                    "{field} '{value}' maps to {n} products"
                )))
            }
        }
    }

    /// Fuzzy fallback: normalized name token-set Jaccard >= 0.85 AND brand
    /// match; ties broken by most-recently-enriched product.
    fn fuzzy_match(&self, row: &RawPriceRow) -> Option<ProductId> {
        let name = row.name.as_deref()?;
        let brand_name = row.brand.as_deref()?;
        let row_tokens = name_tokens(name);
        if row_tokens.is_empty() {
            return None;
        }

        let mut best: Option<(f64, Product)> = None;
        for product in self.catalog.active_products() {
            let brand = match self.catalog.brand(product.brand_id) {
                Some(b) => b,
                None => continue,
            };
            if !brand.matches(brand_name) {
                continue;
            }

            let score = jaccard(&row_tokens, &name_tokens(&product.name));
            if score < FUZZY_THRESHOLD {
                continue;
            }

            let better = match &best {
                None => true,
                Some((best_score, best_product)) => {
                    score > *best_score
                        || (score == *best_score
                            && product.last_enriched_at > best_product.last_enriched_at)
                }
            };
            if better {
                best = Some((score, product));
            }
        }

        if let Some((score, product)) = &best {
            debug!(
                product_id = %product.id,
                score = format!("{score:.3}"),
                "fuzzy product match"
            );
        }
        best.map(|(_, p)| p.id)
    }
}

/// Lowercase, strip punctuation, collapse whitespace, then tokenize.
fn name_tokens(name: &str) -> HashSet<String> {
    fold_name(
        &name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>(),
    )
    .split_whitespace()
    .map(|t| t.to_string())
    .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::InMemoryCatalog;
    use crate::models::Brand;
    use chrono::Utc;

    fn catalog_with(products: Vec<Product>, brands: Vec<Brand>) -> Arc<InMemoryCatalog> {
        let catalog = Arc::new(InMemoryCatalog::new());
        for b in brands {
            catalog.insert_brand(b);
        }
        for p in products {
            catalog.insert_product(p);
        }
        catalog
    }

    fn row(name: &str, brand: &str) -> RawPriceRow {
        RawPriceRow {
            name: Some(name.to_string()),
            brand: Some(brand.to_string()),
            price: 100.0,
            currency: "EUR".to_string(),
            in_stock: true,
            ..Default::default()
        }
    }

    #[test]
    fn stable_id_beats_fuzzy() {
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        let by_id = Product::new("SKU-A", "Completely Different Name", brand_id, "sneakers")
            .with_stockx_id("sx-123");
        let by_name = Product::new("SKU-B", "Dunk Low Panda", brand_id, "sneakers");
        let expected = by_id.id;

        let matcher = ProductMatcher::new(catalog_with(vec![by_id, by_name], vec![brand]));

        let mut r = row("Dunk Low Panda", "Nike");
        r.platform_product_id = Some("sx-123".to_string());
        assert_eq!(matcher.match_row(&r).unwrap(), Some(expected));
    }

    #[test]
    fn style_code_is_separator_insensitive() {
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        let product =
            Product::new("SKU-A", "Dunk Low", brand_id, "sneakers").with_style_code("DD1391-100");
        let expected = product.id;
        let matcher = ProductMatcher::new(catalog_with(vec![product], vec![brand]));

        let mut r = row("whatever", "whoever");
        r.style_code = Some("dd1391 100".to_string());
        assert_eq!(matcher.match_row(&r).unwrap(), Some(expected));
    }

    #[test]
    fn fuzzy_requires_brand_match() {
        let nike = Brand::new("Nike");
        let adidas = Brand::new("Adidas");
        let product = Product::new("SKU-A", "Dunk Low Retro Panda", nike.id, "sneakers");
        let matcher = ProductMatcher::new(catalog_with(vec![product], vec![nike, adidas]));

        assert_eq!(
            matcher
                .match_row(&row("Dunk Low Retro Panda", "Adidas"))
                .unwrap(),
            None
        );
        assert!(matcher
            .match_row(&row("dunk low retro panda", "nike"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn fuzzy_below_threshold_returns_none() {
        let nike = Brand::new("Nike");
        let product = Product::new("SKU-A", "Air Jordan 1 Retro High OG Chicago", nike.id, "sneakers");
        let matcher = ProductMatcher::new(catalog_with(vec![product], vec![nike]));

        assert_eq!(matcher.match_row(&row("Air Max 90", "Nike")).unwrap(), None);
    }

    #[test]
    fn fuzzy_tie_prefers_recent_enrichment() {
        let nike = Brand::new("Nike");
        let brand_id = nike.id;
        let mut stale = Product::new("SKU-A", "Dunk Low Panda", brand_id, "sneakers");
        stale.last_enriched_at = Some(Utc::now() - chrono::Duration::days(30));
        let mut fresh = Product::new("SKU-B", "Dunk Low Panda", brand_id, "sneakers");
        fresh.last_enriched_at = Some(Utc::now());
        let expected = fresh.id;

        let matcher = ProductMatcher::new(catalog_with(vec![stale, fresh], vec![nike]));
        assert_eq!(
            matcher.match_row(&row("dunk low panda", "nike")).unwrap(),
            Some(expected)
        );
    }

    #[test]
    fn duplicate_stable_id_is_a_fault() {
        let nike = Brand::new("Nike");
        let brand_id = nike.id;
        let a = Product::new("SKU-A", "Dunk Low", brand_id, "sneakers").with_ean("123");
        let b = Product::new("SKU-B", "Dunk High", brand_id, "sneakers").with_ean("123");
        let matcher = ProductMatcher::new(catalog_with(vec![a, b], vec![nike]));

        let mut r = row("Dunk Low", "Nike");
        r.ean = Some("123".to_string());
        assert!(matches!(
            matcher.match_row(&r),
            Err(EngineError::DataIntegrity(_))
        ));
    }
}
