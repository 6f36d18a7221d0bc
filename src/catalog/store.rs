//! Catalog read API.
//!
//! The catalog itself (CRUD, migrations, enrichment jobs) lives outside the
//! engine; this seam provides the id-keyed lookups the pipeline needs. The
//! in-memory implementation backs tests and single-process deployments.

use crate::models::{Brand, BrandId, Product, ProductId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to Product/Brand by id and by stable external identifiers.
pub trait ProductCatalog: Send + Sync {
    fn product(&self, id: ProductId) -> Option<Product>;
    fn brand(&self, id: BrandId) -> Option<Brand>;

    /// All products sharing the given external platform id (StockX).
    fn by_stockx_id(&self, id: &str) -> Vec<Product>;
    fn by_ean(&self, ean: &str) -> Vec<Product>;
    fn by_gtin(&self, gtin: &str) -> Vec<Product>;
    /// Style-code lookup; callers pass the code verbatim, implementations
    /// match case-insensitively with separators stripped.
    fn by_style_code(&self, style_code: &str) -> Vec<Product>;

    /// Active products, for the fuzzy fallback sweep.
    fn active_products(&self) -> Vec<Product>;
}

/// Strip separators and fold case so "DD1391-100", "dd1391 100" and
/// "DD1391.100" all key identically.
pub fn normalize_style_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Default)]
struct CatalogInner {
    products: HashMap<ProductId, Product>,
    brands: HashMap<BrandId, Brand>,
    by_stockx: HashMap<String, Vec<ProductId>>,
    by_ean: HashMap<String, Vec<ProductId>>,
    by_gtin: HashMap<String, Vec<ProductId>>,
    by_style: HashMap<String, Vec<ProductId>>,
}

/// In-memory catalog with id indexes.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_brand(&self, brand: Brand) {
        self.inner.write().brands.insert(brand.id, brand);
    }

    pub fn insert_product(&self, product: Product) {
        let mut inner = self.inner.write();
        if let Some(id) = &product.stockx_product_id {
            inner
                .by_stockx
                .entry(id.clone())
                .or_default()
                .push(product.id);
        }
        if let Some(ean) = &product.ean {
            inner.by_ean.entry(ean.clone()).or_default().push(product.id);
        }
        if let Some(gtin) = &product.gtin {
            inner
                .by_gtin
                .entry(gtin.clone())
                .or_default()
                .push(product.id);
        }
        if let Some(code) = &product.style_code {
            inner
                .by_style
                .entry(normalize_style_code(code))
                .or_default()
                .push(product.id);
        }
        inner.products.insert(product.id, product);
    }

    pub fn len(&self) -> usize {
        self.inner.read().products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, ids: Option<Vec<ProductId>>) -> Vec<Product> {
        let inner = self.inner.read();
        ids.unwrap_or_default()
            .into_iter()
            .filter_map(|id| inner.products.get(&id).cloned())
            .collect()
    }
}

impl ProductCatalog for InMemoryCatalog {
    fn product(&self, id: ProductId) -> Option<Product> {
        self.inner.read().products.get(&id).cloned()
    }

    fn brand(&self, id: BrandId) -> Option<Brand> {
        self.inner.read().brands.get(&id).cloned()
    }

    fn by_stockx_id(&self, id: &str) -> Vec<Product> {
        let ids = self.inner.read().by_stockx.get(id).cloned();
        self.resolve(ids)
    }

    fn by_ean(&self, ean: &str) -> Vec<Product> {
        let ids = self.inner.read().by_ean.get(ean).cloned();
        self.resolve(ids)
    }

    fn by_gtin(&self, gtin: &str) -> Vec<Product> {
        let ids = self.inner.read().by_gtin.get(gtin).cloned();
        self.resolve(ids)
    }

    fn by_style_code(&self, style_code: &str) -> Vec<Product> {
        let ids = self
            .inner
            .read()
            .by_style
            .get(&normalize_style_code(style_code))
            .cloned();
        self.resolve(ids)
    }

    fn active_products(&self) -> Vec<Product> {
        self.inner
            .read()
            .products
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Brand;

    #[test]
    fn style_code_normalization() {
        assert_eq!(normalize_style_code("DD1391-100"), "dd1391100");
        assert_eq!(normalize_style_code("dd1391 100"), "dd1391100");
        assert_eq!(normalize_style_code("DD1391.100"), "dd1391100");
    }

    #[test]
    fn indexed_lookups() {
        let catalog = InMemoryCatalog::new();
        let brand = Brand::new("Nike");
        let brand_id = brand.id;
        catalog.insert_brand(brand);

        let product = Product::new("SKU-1", "Dunk Low Panda", brand_id, "sneakers")
            .with_style_code("DD1391-100")
            .with_ean("0195866131620");
        let pid = product.id;
        catalog.insert_product(product);

        assert_eq!(catalog.by_style_code("dd1391 100")[0].id, pid);
        assert_eq!(catalog.by_ean("0195866131620")[0].id, pid);
        assert!(catalog.by_stockx_id("missing").is_empty());
    }
}
