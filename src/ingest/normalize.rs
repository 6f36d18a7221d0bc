//! Per-source payload normalization.
//!
//! Every upstream feed speaks its own dialect; each source gets one
//! normalization function producing the single `RawPriceRow` shape. Fields
//! the core does not understand ride along in the opaque `extra` blob.

use crate::models::{RawPriceRow, SourceId, Variant};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Extract the row list from a payload that may be a bare array or an
/// object wrapping one under a well-known key.
fn row_items(payload: &Value) -> Vec<&Value> {
    match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => ["products", "data", "items", "results"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_array()))
            .map(|items| items.iter().collect())
            .unwrap_or_else(|| vec![payload]),
        _ => Vec::new(),
    }
}

fn get_str(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        item.get(*k).and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    })
}

fn get_f64(item: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        item.get(*k).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    })
}

fn get_bool(item: &Value, keys: &[&str], default: bool) -> bool {
    keys.iter()
        .find_map(|k| {
            item.get(*k).and_then(|v| match v {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => Some(n.as_i64().unwrap_or(0) != 0),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" | "in_stock" | "instock" => Some(true),
                    "false" | "no" | "0" | "out_of_stock" => Some(false),
                    _ => None,
                },
                _ => None,
            })
        })
        .unwrap_or(default)
}

fn get_time(item: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    get_str(item, keys).and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse a human size label into a locale-independent standardized value
/// on the US men's scale: "US 10" -> 10, "UK 9.5" -> 10, "EU 44" -> 10.
pub fn parse_size(raw: &str) -> Option<Variant> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let upper = trimmed.to_ascii_uppercase();

    let (locale, number) = if let Some(rest) = upper.strip_prefix("US") {
        ("US", rest)
    } else if let Some(rest) = upper.strip_prefix("UK") {
        ("UK", rest)
    } else if let Some(rest) = upper.strip_prefix("EU") {
        ("EU", rest)
    } else {
        ("US", upper.as_str())
    };

    let value: f64 = number.trim().parse().ok()?;
    let standardized = match locale {
        "UK" => value + 0.5,
        "EU" => value - 34.0,
        _ => value,
    };
    if !(1.0..=25.0).contains(&standardized) {
        return None;
    }
    Some(Variant::new(trimmed, standardized))
}

/// Normalize one upstream payload into raw rows for `source`.
/// Rows without a usable price are dropped here, before matching.
pub fn normalize_payload(source: &SourceId, payload: &Value) -> Vec<RawPriceRow> {
    row_items(payload)
        .into_iter()
        .filter_map(|item| normalize_item(source, item))
        .collect()
}

fn normalize_item(source: &SourceId, item: &Value) -> Option<RawPriceRow> {
    let mut row = match source {
        SourceId::Awin | SourceId::Webgains => RawPriceRow {
            external_id: get_str(item, &["aw_product_id", "product_id", "pid", "id"]),
            ean: get_str(item, &["ean", "product_ean"]),
            gtin: get_str(item, &["gtin", "product_gtin"]),
            style_code: get_str(item, &["mpn", "model_number", "style_code"]),
            name: get_str(item, &["product_name", "name", "title"]),
            brand: get_str(item, &["brand_name", "brand"]),
            size: get_str(item, &["size", "product_size"]),
            price: get_f64(item, &["search_price", "price", "store_price"])?,
            currency: get_str(item, &["currency"]).unwrap_or_else(|| "EUR".to_string()),
            in_stock: get_bool(item, &["in_stock", "stock_status"], true),
            stock_qty: get_f64(item, &["stock_quantity", "stock_qty"]).map(|q| q as u32),
            supplier: get_str(item, &["merchant_name", "supplier", "retailer"]),
            url: get_str(item, &["merchant_deep_link", "aw_deep_link", "url", "deeplink"]),
            observed_at: get_time(item, &["last_updated", "observed_at"]),
            ..Default::default()
        },
        SourceId::Stockx => RawPriceRow {
            external_id: get_str(item, &["id", "productId", "uuid"]),
            platform_product_id: get_str(item, &["productId", "id"]),
            style_code: get_str(item, &["styleId", "style_id"]),
            name: get_str(item, &["title", "name"]),
            brand: get_str(item, &["brand"]),
            size: get_str(item, &["size", "shoeSize"]),
            price: get_f64(item, &["lowestAsk", "amount", "price"])?,
            currency: get_str(item, &["currencyCode", "currency"])
                .unwrap_or_else(|| "EUR".to_string()),
            in_stock: true,
            url: get_str(item, &["urlKey", "url"]),
            observed_at: get_time(item, &["updatedAt", "observed_at"]),
            ..Default::default()
        },
        SourceId::Goat => {
            // GOAT quotes minor units
            let cents = get_f64(item, &["lowest_price_cents", "price_cents"])?;
            RawPriceRow {
                external_id: get_str(item, &["id", "slug"]),
                style_code: get_str(item, &["sku", "style_code"]),
                name: get_str(item, &["name", "title"]),
                brand: get_str(item, &["brand_name", "brand"]),
                size: get_str(item, &["size"]),
                price: cents / 100.0,
                currency: get_str(item, &["currency"]).unwrap_or_else(|| "EUR".to_string()),
                in_stock: get_bool(item, &["in_stock"], true),
                url: get_str(item, &["url", "slug"]),
                observed_at: get_time(item, &["updated_at"]),
                ..Default::default()
            }
        }
        SourceId::Ebay | SourceId::Klekt | SourceId::Restocks | SourceId::Other(_) => {
            RawPriceRow {
                external_id: get_str(item, &["id", "item_id", "listing_id"]),
                ean: get_str(item, &["ean"]),
                gtin: get_str(item, &["gtin"]),
                style_code: get_str(item, &["style_code", "sku", "mpn"]),
                name: get_str(item, &["name", "title"]),
                brand: get_str(item, &["brand", "brand_name"]),
                size: get_str(item, &["size"]),
                price: get_f64(item, &["price", "current_price", "buy_now_price"])?,
                currency: get_str(item, &["currency"]).unwrap_or_else(|| "EUR".to_string()),
                in_stock: get_bool(item, &["in_stock", "available"], true),
                stock_qty: get_f64(item, &["quantity", "stock_qty"]).map(|q| q as u32),
                supplier: get_str(item, &["seller", "supplier"]),
                url: get_str(item, &["url", "view_item_url"]),
                observed_at: get_time(item, &["observed_at", "updated_at"]),
                ..Default::default()
            }
        }
    };

    if row.price < 0.0 {
        return None;
    }
    row.extra = Some(item.clone());
    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn awin_feed_rows() {
        let payload = json!({
            "products": [{
                "aw_product_id": "aw-1",
                "product_name": "Dunk Low Panda",
                "brand_name": "Nike",
                "ean": "0195866131620",
                "search_price": "119.95",
                "stock_quantity": 5,
                "merchant_name": "AfewStore",
                "merchant_deep_link": "https://example.test/p/1",
                "size": "EU 44",
                "custom_field_7": "ignored-but-kept"
            }]
        });

        let rows = normalize_payload(&SourceId::Awin, &payload);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.external_id.as_deref(), Some("aw-1"));
        assert_eq!(row.price, 119.95);
        assert_eq!(row.supplier.as_deref(), Some("AfewStore"));
        assert_eq!(row.stock_qty, Some(5));
        // Unknown upstream fields ride along in extra
        assert_eq!(
            row.extra.as_ref().unwrap()["custom_field_7"],
            json!("ignored-but-kept")
        );
    }

    #[test]
    fn stockx_rows_carry_platform_id() {
        let payload = json!([{
            "productId": "sx-abc",
            "title": "Dunk Low Panda",
            "brand": "Nike",
            "styleId": "DD1391-100",
            "lowestAsk": 180.0,
            "size": "US 10"
        }]);

        let rows = normalize_payload(&SourceId::Stockx, &payload);
        assert_eq!(rows[0].platform_product_id.as_deref(), Some("sx-abc"));
        assert_eq!(rows[0].price, 180.0);
    }

    #[test]
    fn goat_prices_are_minor_units() {
        let payload = json!([{ "id": "g-1", "name": "Dunk", "lowest_price_cents": 18050 }]);
        let rows = normalize_payload(&SourceId::Goat, &payload);
        assert_eq!(rows[0].price, 180.50);
    }

    #[test]
    fn rows_without_price_are_dropped() {
        let payload = json!([{ "id": "x", "name": "No price here" }]);
        assert!(normalize_payload(&SourceId::Ebay, &payload).is_empty());
    }

    #[test]
    fn size_standardization_across_locales() {
        assert_eq!(parse_size("US 10").unwrap().standardized, 10.0);
        assert_eq!(parse_size("UK 9.5").unwrap().standardized, 10.0);
        assert_eq!(parse_size("EU 44").unwrap().standardized, 10.0);
        assert_eq!(parse_size("10.5").unwrap().standardized, 10.5);
        assert!(parse_size("EU 2").is_none());
        assert!(parse_size("one size").is_none());
    }
}
