//! Price store.
//!
//! One active row per (product, source, variant); every effective change
//! appends a history event in the same transaction so audit history is never
//! ahead of or behind state.
//!
//! Key optimizations carried over from production use:
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Explicit transactions for multi-statement writes

use crate::error::{EngineError, EngineResult};
use crate::models::{PriceHistoryEvent, PriceRecord, ProductId, SourceId, SourceKind, Variant};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Minimum price delta that counts as a change (0.01 of the minor unit).
pub const PRICE_EPSILON: f64 = 0.01;

/// Sentinel variant key for records without a size variant.
const NO_VARIANT: f64 = -1.0;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS price_records (
    product_id TEXT NOT NULL,
    source TEXT NOT NULL,
    variant_key REAL NOT NULL,
    source_kind TEXT NOT NULL,
    variant_id TEXT,
    variant_value TEXT,
    supplier TEXT,
    price REAL NOT NULL,
    currency TEXT NOT NULL,
    in_stock INTEGER NOT NULL,
    stock_qty INTEGER,
    external_url TEXT,
    external_id TEXT,
    observed_at INTEGER NOT NULL,
    metadata_json TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (product_id, source, variant_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_price_records_kind_updated
    ON price_records(source_kind, updated_at DESC);

CREATE INDEX IF NOT EXISTS idx_price_records_product
    ON price_records(product_id, observed_at DESC);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id TEXT NOT NULL,
    source TEXT NOT NULL,
    variant_key REAL NOT NULL,
    old_price REAL,
    new_price REAL NOT NULL,
    old_in_stock INTEGER,
    new_in_stock INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_history_product_ts
    ON price_history(product_id, recorded_at DESC);
"#;

/// Result of a single upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// True when the price moved by >= epsilon or stock availability flipped.
    pub changed: bool,
    /// The history event written alongside the change, if any.
    pub event: Option<PriceHistoryEvent>,
}

/// A finite, restartable page of recently changed records.
#[derive(Debug, Clone)]
pub struct IteratePage {
    pub records: Vec<PriceRecord>,
    /// Opaque cursor; feed back into `iterate` to resume after this page.
    pub next_cursor: Option<String>,
}

pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PriceStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open price database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize price store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_records", [], |row| row.get(0))
            .unwrap_or(0);
        info!("💾 Price store ready at {} ({} active records)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent upsert keyed by (source, product, variant).
    ///
    /// Appends a history event in the same transaction when the price moves
    /// by >= epsilon or the stock flag flips. An `observed_at` older than the
    /// stored row is a `DataIntegrity` fault: the record is rejected.
    pub fn upsert(&self, record: &PriceRecord) -> EngineResult<UpsertOutcome> {
        let variant_key = record
            .variant
            .as_ref()
            .map(|v| v.standardized)
            .unwrap_or(NO_VARIANT);
        let observed_ms = record.observed_at.timestamp_millis();
        let now_ms = Utc::now().timestamp_millis();

        let conn = self.conn.lock();

        let existing: Option<(f64, bool, i64)> = conn
            .prepare_cached(
                "SELECT price, in_stock, observed_at FROM price_records \
                 WHERE product_id = ?1 AND source = ?2 AND variant_key = ?3",
            )?
            .query_row(
                params![record.product_id.to_string(), record.source.as_str(), variant_key],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        if let Some((_, _, stored_observed)) = existing {
            if observed_ms < stored_observed {
                counter!("soleflip_observed_at_regressions_total", 1);
                return Err(EngineError::DataIntegrity(format!(
                    "observed_at regressed for ({}, {}, {})",
                    record.product_id, record.source, variant_key
                )));
            }
        }

        let (changed, old_price, old_in_stock) = match existing {
            None => (true, None, None),
            Some((price, in_stock, _)) => {
                let moved = (record.price - price).abs() >= PRICE_EPSILON;
                let flipped = in_stock != record.in_stock;
                (moved || flipped, Some(price), Some(in_stock))
            }
        };

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> EngineResult<Option<PriceHistoryEvent>> {
            conn.prepare_cached(
                "INSERT INTO price_records (\
                     product_id, source, variant_key, source_kind, variant_id, variant_value, \
                     supplier, price, currency, in_stock, stock_qty, external_url, external_id, \
                     observed_at, metadata_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
                 ON CONFLICT(product_id, source, variant_key) DO UPDATE SET \
                     supplier = excluded.supplier, \
                     price = excluded.price, \
                     currency = excluded.currency, \
                     in_stock = excluded.in_stock, \
                     stock_qty = excluded.stock_qty, \
                     external_url = excluded.external_url, \
                     external_id = excluded.external_id, \
                     observed_at = excluded.observed_at, \
                     metadata_json = excluded.metadata_json, \
                     updated_at = excluded.updated_at",
            )?
            .execute(params![
                record.product_id.to_string(),
                record.source.as_str(),
                variant_key,
                record.source.kind().as_str(),
                record.variant.as_ref().map(|v| v.id.to_string()),
                record.variant.as_ref().map(|v| v.value.clone()),
                record.supplier,
                record.price,
                record.currency,
                record.in_stock as i64,
                record.stock_qty,
                record.external_url,
                record.external_id,
                observed_ms,
                record
                    .metadata
                    .as_ref()
                    .map(|m| m.to_string()),
                now_ms,
            ])?;

            if !changed {
                return Ok(None);
            }

            conn.prepare_cached(
                "INSERT INTO price_history (\
                     product_id, source, variant_key, old_price, new_price, \
                     old_in_stock, new_in_stock, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                record.product_id.to_string(),
                record.source.as_str(),
                variant_key,
                old_price,
                record.price,
                old_in_stock.map(|b| b as i64),
                record.in_stock as i64,
                observed_ms,
            ])?;
            let event_id = conn.last_insert_rowid();

            Ok(Some(PriceHistoryEvent {
                id: event_id,
                product_id: record.product_id,
                variant_standardized: record.variant.as_ref().map(|v| v.standardized),
                source: record.source.clone(),
                old_price,
                new_price: record.price,
                old_in_stock,
                new_in_stock: record.in_stock,
                recorded_at: record.observed_at,
            }))
        })();

        match result {
            Ok(event) => {
                conn.execute("COMMIT", [])?;
                if event.is_some() {
                    counter!("soleflip_price_history_events_total", 1);
                }
                Ok(UpsertOutcome { changed, event })
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Most recent record per (source, variant) for a product, newest first.
    pub fn latest(
        &self,
        product_id: ProductId,
        kind: Option<SourceKind>,
    ) -> EngineResult<Vec<PriceRecord>> {
        let conn = self.conn.lock();
        let records = match kind {
            Some(kind) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM price_records \
                     WHERE product_id = ?1 AND source_kind = ?2 \
                     ORDER BY observed_at DESC",
                )?;
                let rows = stmt.query_map(
                    params![product_id.to_string(), kind.as_str()],
                    Self::row_to_record,
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM price_records WHERE product_id = ?1 \
                     ORDER BY observed_at DESC",
                )?;
                let rows =
                    stmt.query_map(params![product_id.to_string()], Self::row_to_record)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    /// Lazy iteration over records of a kind changed since `since`, oldest
    /// first, restartable from an opaque cursor.
    pub fn iterate(
        &self,
        kind: SourceKind,
        since: DateTime<Utc>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> EngineResult<IteratePage> {
        let (after_ms, after_product, after_source) = match cursor {
            Some(c) => parse_cursor(c)?,
            None => (since.timestamp_millis(), String::new(), String::new()),
        };

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM price_records \
             WHERE source_kind = ?1 \
               AND (updated_at > ?2 \
                    OR (updated_at = ?2 AND (product_id > ?3 \
                        OR (product_id = ?3 AND source > ?4)))) \
             ORDER BY updated_at ASC, product_id ASC, source ASC \
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                kind.as_str(),
                after_ms,
                after_product,
                after_source,
                page_size as i64
            ],
            |row| {
                let updated_at: i64 = row.get("updated_at")?;
                Ok((updated_at, Self::row_to_record(row)?))
            },
        )?;

        let mut records = Vec::with_capacity(page_size);
        let mut last: Option<(i64, String, String)> = None;
        for row in rows {
            let (updated_at, record) = row?;
            last = Some((
                updated_at,
                record.product_id.to_string(),
                record.source.as_str().to_string(),
            ));
            records.push(record);
        }

        let next_cursor = if records.len() == page_size {
            last.map(|(ms, product, source)| format!("{ms}|{product}|{source}"))
        } else {
            None
        };

        Ok(IteratePage {
            records,
            next_cursor,
        })
    }

    /// Product ids holding at least one record of each of the two kinds.
    pub fn products_with_kinds(
        &self,
        buy_kind: SourceKind,
        sell_kind: SourceKind,
    ) -> EngineResult<Vec<ProductId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_id FROM price_records \
             WHERE source_kind IN (?1, ?2) \
             GROUP BY product_id \
             HAVING COUNT(DISTINCT source_kind) = 2 \
             ORDER BY product_id",
        )?;
        let rows = stmt.query_map(params![buy_kind.as_str(), sell_kind.as_str()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            match Uuid::parse_str(&raw) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(product_id = %raw, "unparseable product id in price store"),
            }
        }
        Ok(ids)
    }

    /// History events for a product since `since`, oldest first.
    pub fn history_for(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<PriceHistoryEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, product_id, source, variant_key, old_price, new_price, \
                    old_in_stock, new_in_stock, recorded_at \
             FROM price_history \
             WHERE product_id = ?1 AND recorded_at >= ?2 \
             ORDER BY recorded_at ASC",
        )?;
        let rows = stmt.query_map(
            params![product_id.to_string(), since.timestamp_millis()],
            |row| {
                Ok(PriceHistoryEvent {
                    id: row.get(0)?,
                    product_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                    source: SourceId::parse(&row.get::<_, String>(2)?),
                    variant_standardized: {
                        let key: f64 = row.get(3)?;
                        (key >= 0.0).then_some(key)
                    },
                    old_price: row.get(4)?,
                    new_price: row.get(5)?,
                    old_in_stock: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
                    new_in_stock: row.get::<_, i64>(7)? != 0,
                    recorded_at: Utc
                        .timestamp_millis_opt(row.get(8)?)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Delete history events older than `cutoff`. Returns rows removed.
    pub fn prune_history_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM price_history WHERE recorded_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    pub fn optimize(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM price_records", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn history_count(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM price_history", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PriceRecord> {
        let variant_key: f64 = row.get("variant_key")?;
        let variant = if variant_key >= 0.0 {
            let id: Option<String> = row.get("variant_id")?;
            let value: Option<String> = row.get("variant_value")?;
            Some(Variant {
                id: id
                    .and_then(|s| Uuid::parse_str(&s).ok())
                    .unwrap_or_else(Uuid::new_v4),
                value: value.unwrap_or_default(),
                standardized: variant_key,
            })
        } else {
            None
        };

        Ok(PriceRecord {
            product_id: Uuid::parse_str(&row.get::<_, String>("product_id")?)
                .unwrap_or_default(),
            variant,
            source: SourceId::parse(&row.get::<_, String>("source")?),
            supplier: row.get("supplier")?,
            price: row.get("price")?,
            currency: row.get("currency")?,
            in_stock: row.get::<_, i64>("in_stock")? != 0,
            stock_qty: row.get("stock_qty")?,
            external_url: row.get("external_url")?,
            external_id: row.get("external_id")?,
            observed_at: Utc
                .timestamp_millis_opt(row.get("observed_at")?)
                .single()
                .unwrap_or_else(Utc::now),
            metadata: row
                .get::<_, Option<String>>("metadata_json")?
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

fn parse_cursor(cursor: &str) -> EngineResult<(i64, String, String)> {
    let mut parts = cursor.splitn(3, '|');
    let (Some(ms), Some(product), Some(source)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(EngineError::DataIntegrity(format!(
            "malformed iterate cursor '{cursor}'"
        )));
    };
    let ms = ms
        .parse::<i64>()
        .map_err(|_| EngineError::DataIntegrity(format!("malformed iterate cursor '{cursor}'")))?;
    Ok((ms, product.to_string(), source.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (PriceStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prices.db");
        (PriceStore::new(path.to_str().unwrap()).unwrap(), dir)
    }

    fn record(product_id: ProductId, source: SourceId, price: f64) -> PriceRecord {
        PriceRecord {
            product_id,
            variant: Some(Variant::new("US 10", 10.0)),
            source,
            supplier: Some("AfewStore".to_string()),
            price,
            currency: "EUR".to_string(),
            in_stock: true,
            stock_qty: Some(5),
            external_url: None,
            external_id: Some("ext-1".to_string()),
            observed_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn first_upsert_writes_history() {
        let (store, _dir) = store();
        let outcome = store
            .upsert(&record(Uuid::new_v4(), SourceId::Awin, 120.0))
            .unwrap();
        assert!(outcome.changed);
        let event = outcome.event.unwrap();
        assert_eq!(event.old_price, None);
        assert_eq!(event.new_price, 120.0);
        assert_eq!(store.history_count(), 1);
    }

    #[test]
    fn sub_epsilon_change_is_a_noop() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        store.upsert(&record(pid, SourceId::Awin, 120.0)).unwrap();

        let mut next = record(pid, SourceId::Awin, 120.005);
        next.observed_at = Utc::now() + chrono::Duration::seconds(1);
        let outcome = store.upsert(&next).unwrap();
        assert!(!outcome.changed);
        assert!(outcome.event.is_none());
        assert_eq!(store.history_count(), 1);
    }

    #[test]
    fn epsilon_change_writes_exactly_one_event() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        store.upsert(&record(pid, SourceId::Awin, 120.0)).unwrap();

        let mut next = record(pid, SourceId::Awin, 120.01);
        next.observed_at = Utc::now() + chrono::Duration::seconds(1);
        let outcome = store.upsert(&next).unwrap();
        assert!(outcome.changed);
        let event = outcome.event.unwrap();
        assert_eq!(event.old_price, Some(120.0));
        assert_eq!(event.new_price, 120.01);
        assert_eq!(store.history_count(), 2);
    }

    #[test]
    fn stock_flip_writes_history() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        store.upsert(&record(pid, SourceId::Awin, 120.0)).unwrap();

        let mut next = record(pid, SourceId::Awin, 120.0);
        next.in_stock = false;
        next.observed_at = Utc::now() + chrono::Duration::seconds(1);
        let outcome = store.upsert(&next).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.event.unwrap().new_in_stock, false);
    }

    #[test]
    fn observed_at_regression_is_rejected() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        store.upsert(&record(pid, SourceId::Awin, 120.0)).unwrap();

        let mut stale = record(pid, SourceId::Awin, 99.0);
        stale.observed_at = Utc::now() - chrono::Duration::hours(1);
        assert!(matches!(
            store.upsert(&stale),
            Err(EngineError::DataIntegrity(_))
        ));
        // State untouched
        let latest = store.latest(pid, None).unwrap();
        assert_eq!(latest[0].price, 120.0);
    }

    #[test]
    fn latest_filters_by_kind() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        store.upsert(&record(pid, SourceId::Awin, 120.0)).unwrap();
        store.upsert(&record(pid, SourceId::Stockx, 180.0)).unwrap();

        let retail = store.latest(pid, Some(SourceKind::Retail)).unwrap();
        assert_eq!(retail.len(), 1);
        assert_eq!(retail[0].source, SourceId::Awin);

        let all = store.latest(pid, None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn iterate_pages_are_restartable() {
        let (store, _dir) = store();
        let since = Utc::now() - chrono::Duration::minutes(1);
        for _ in 0..5 {
            store
                .upsert(&record(Uuid::new_v4(), SourceId::Awin, 100.0))
                .unwrap();
        }

        let first = store.iterate(SourceKind::Retail, since, None, 2).unwrap();
        assert_eq!(first.records.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let mut seen = first.records.len();
        let mut cursor = Some(cursor);
        while let Some(c) = cursor {
            let page = store
                .iterate(SourceKind::Retail, since, Some(&c), 2)
                .unwrap();
            seen += page.records.len();
            cursor = page.next_cursor;
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn products_with_both_kinds() {
        let (store, _dir) = store();
        let both = Uuid::new_v4();
        let only_retail = Uuid::new_v4();
        store.upsert(&record(both, SourceId::Awin, 120.0)).unwrap();
        store.upsert(&record(both, SourceId::Stockx, 180.0)).unwrap();
        store
            .upsert(&record(only_retail, SourceId::Awin, 80.0))
            .unwrap();

        let ids = store
            .products_with_kinds(SourceKind::Retail, SourceKind::Resale)
            .unwrap();
        assert_eq!(ids, vec![both]);
    }

    #[test]
    fn history_pruning() {
        let (store, _dir) = store();
        let pid = Uuid::new_v4();
        let mut old = record(pid, SourceId::Awin, 100.0);
        old.observed_at = Utc::now() - chrono::Duration::days(400);
        store.upsert(&old).unwrap();

        let removed = store
            .prune_history_before(Utc::now() - chrono::Duration::days(365))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.history_count(), 0);
    }
}
