//! Alert store.
//!
//! Alert definitions are user-owned rows; the scheduler is the only writer
//! of counters and scan/trigger timestamps. User-side definition updates go
//! through optimistic concurrency on a version counter. The dispatch log
//! backs idempotency-key dedupe across restarts.

use crate::error::{EngineError, EngineResult};
use crate::models::SourceId;
use crate::scoring::RiskLevel;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Consecutive delivery failures before an alert is auto-deactivated.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    min_profit_margin REAL NOT NULL,
    min_gross_profit REAL NOT NULL,
    min_feasibility_score REAL NOT NULL,
    max_risk_level TEXT NOT NULL,
    source_allowlist TEXT,
    max_buy_price REAL,
    max_opportunities INTEGER NOT NULL DEFAULT 10,
    webhook_url TEXT NOT NULL,
    notification_config TEXT NOT NULL DEFAULT '{}',
    frequency_minutes INTEGER NOT NULL,
    active_hours_start INTEGER NOT NULL DEFAULT 0,
    active_hours_end INTEGER NOT NULL DEFAULT 0,
    active_days TEXT NOT NULL DEFAULT 'mon,tue,wed,thu,fri,sat,sun',
    timezone TEXT NOT NULL DEFAULT 'UTC',
    total_alerts_sent INTEGER NOT NULL DEFAULT 0,
    total_opportunities_sent INTEGER NOT NULL DEFAULT 0,
    total_failed_deliveries INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_scanned_at INTEGER,
    last_triggered_at INTEGER,
    last_error TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_alerts_active
    ON alerts(active, last_scanned_at);

CREATE TABLE IF NOT EXISTS dispatch_log (
    alert_id TEXT NOT NULL,
    dispatch_key TEXT NOT NULL,
    dispatched_at INTEGER NOT NULL,
    PRIMARY KEY (alert_id, dispatch_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_dispatch_log_at
    ON dispatch_log(dispatched_at);
"#;

/// A user's standing scan-and-notify instruction.
#[derive(Debug, Clone)]
pub struct AlertDefinition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,

    pub min_profit_margin: f64,
    pub min_gross_profit: f64,
    pub min_feasibility_score: f64,
    pub max_risk_level: RiskLevel,
    pub source_allowlist: Option<Vec<SourceId>>,
    pub max_buy_price: Option<f64>,
    pub max_opportunities: usize,

    pub webhook_url: String,
    /// Free-form tag map forwarded verbatim in the payload.
    pub notification_config: HashMap<String, serde_json::Value>,

    pub frequency_minutes: u32,
    /// Daily window [start, end) in local hours; start == end means all day,
    /// start > end wraps past midnight.
    pub active_hours_start: u8,
    pub active_hours_end: u8,
    pub active_days: Vec<Weekday>,
    /// IANA timezone identifier.
    pub timezone: String,

    pub total_alerts_sent: u64,
    pub total_opportunities_sent: u64,
    pub total_failed_deliveries: u64,
    pub consecutive_failures: u32,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl AlertDefinition {
    pub fn new(user_id: Uuid, name: &str, webhook_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            active: true,
            min_profit_margin: 0.15,
            min_gross_profit: 10.0,
            min_feasibility_score: 50.0,
            max_risk_level: RiskLevel::Medium,
            source_allowlist: None,
            max_buy_price: None,
            max_opportunities: 10,
            webhook_url: webhook_url.to_string(),
            notification_config: HashMap::new(),
            frequency_minutes: 15,
            active_hours_start: 0,
            active_hours_end: 0,
            active_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            timezone: "UTC".to_string(),
            total_alerts_sent: 0,
            total_opportunities_sent: 0,
            total_failed_deliveries: 0,
            consecutive_failures: 0,
            last_scanned_at: None,
            last_triggered_at: None,
            last_error: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// True when `now` falls inside the alert's local schedule window.
    ///
    /// `fails with ConfigurationInvalid` when the timezone is not a known
    /// IANA identifier.
    pub fn in_schedule_window(&self, now: DateTime<Utc>) -> EngineResult<bool> {
        let tz = Tz::from_str(&self.timezone).map_err(|_| {
            EngineError::ConfigurationInvalid(format!("unknown timezone '{}'", self.timezone))
        })?;
        let local = now.with_timezone(&tz);

        if !self.active_days.contains(&local.weekday()) {
            return Ok(false);
        }

        let hour = local.hour() as u8;
        let (start, end) = (self.active_hours_start, self.active_hours_end);
        let in_window = if start == end {
            true
        } else if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        };
        Ok(in_window)
    }

    /// True when the alert's frequency has elapsed since the last scan.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_scanned_at {
            None => true,
            Some(last) => now - last >= Duration::minutes(self.frequency_minutes as i64),
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.frequency_minutes < 1 {
            return Err(EngineError::ConfigurationInvalid(
                "frequency_minutes must be >= 1".to_string(),
            ));
        }
        if self.active_hours_start > 23 || self.active_hours_end > 23 {
            return Err(EngineError::ConfigurationInvalid(
                "active hours must be within 0..=23".to_string(),
            ));
        }
        if self.active_days.is_empty() {
            return Err(EngineError::ConfigurationInvalid(
                "active_days must not be empty".to_string(),
            ));
        }
        if Tz::from_str(&self.timezone).is_err() {
            return Err(EngineError::ConfigurationInvalid(format!(
                "unknown timezone '{}'",
                self.timezone
            )));
        }
        Ok(())
    }
}

pub struct AlertStore {
    conn: Arc<Mutex<Connection>>,
}

impl AlertStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open alert database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize alert store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
            .unwrap_or(0);
        info!("🔔 Alert store ready at {} ({} alerts)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new alert row (version 0).
    pub fn create(&self, alert: &AlertDefinition) -> EngineResult<()> {
        alert.validate()?;
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO alerts (\
                 id, user_id, name, active, min_profit_margin, min_gross_profit, \
                 min_feasibility_score, max_risk_level, source_allowlist, max_buy_price, \
                 max_opportunities, webhook_url, notification_config, frequency_minutes, \
                 active_hours_start, active_hours_end, active_days, timezone, \
                 total_alerts_sent, total_opportunities_sent, total_failed_deliveries, \
                 consecutive_failures, last_scanned_at, last_triggered_at, last_error, \
                 version, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18, 0, 0, 0, 0, NULL, NULL, NULL, 0, ?19)",
        )?
        .execute(params![
            alert.id.to_string(),
            alert.user_id.to_string(),
            alert.name,
            alert.active as i64,
            alert.min_profit_margin,
            alert.min_gross_profit,
            alert.min_feasibility_score,
            alert.max_risk_level.as_str(),
            alert
                .source_allowlist
                .as_ref()
                .map(|list| list.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")),
            alert.max_buy_price,
            alert.max_opportunities as i64,
            alert.webhook_url,
            serde_json::to_string(&alert.notification_config).unwrap_or_else(|_| "{}".into()),
            alert.frequency_minutes as i64,
            alert.active_hours_start as i64,
            alert.active_hours_end as i64,
            weekdays_to_csv(&alert.active_days),
            alert.timezone,
            alert.created_at.timestamp_millis(),
        ])?;
        Ok(())
    }

    /// Update the user-owned fields under optimistic concurrency. The row's
    /// version must match `alert.version`; on success it is bumped by one.
    pub fn update_definition(&self, alert: &AlertDefinition) -> EngineResult<()> {
        alert.validate()?;
        let conn = self.conn.lock();
        let updated = conn
            .prepare_cached(
                "UPDATE alerts SET \
                     name = ?1, active = ?2, min_profit_margin = ?3, min_gross_profit = ?4, \
                     min_feasibility_score = ?5, max_risk_level = ?6, source_allowlist = ?7, \
                     max_buy_price = ?8, max_opportunities = ?9, webhook_url = ?10, \
                     notification_config = ?11, frequency_minutes = ?12, \
                     active_hours_start = ?13, active_hours_end = ?14, active_days = ?15, \
                     timezone = ?16, version = version + 1 \
                 WHERE id = ?17 AND version = ?18",
            )?
            .execute(params![
                alert.name,
                alert.active as i64,
                alert.min_profit_margin,
                alert.min_gross_profit,
                alert.min_feasibility_score,
                alert.max_risk_level.as_str(),
                alert
                    .source_allowlist
                    .as_ref()
                    .map(|list| list.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")),
                alert.max_buy_price,
                alert.max_opportunities as i64,
                alert.webhook_url,
                serde_json::to_string(&alert.notification_config)
                    .unwrap_or_else(|_| "{}".into()),
                alert.frequency_minutes as i64,
                alert.active_hours_start as i64,
                alert.active_hours_end as i64,
                weekdays_to_csv(&alert.active_days),
                alert.timezone,
                alert.id.to_string(),
                alert.version,
            ])?;

        if updated == 0 {
            return Err(EngineError::DataIntegrity(format!(
                "stale version {} for alert {}",
                alert.version, alert.id
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> EngineResult<Option<AlertDefinition>> {
        let conn = self.conn.lock();
        let alert = conn
            .prepare_cached("SELECT * FROM alerts WHERE id = ?1")?
            .query_row(params![id.to_string()], row_to_alert)
            .optional()?;
        Ok(alert)
    }

    pub fn list_all(&self) -> EngineResult<Vec<AlertDefinition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM alerts ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_alert)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Active alerts whose schedule window contains `now` and whose frequency
    /// has elapsed. Alerts with invalid configuration are deactivated here
    /// rather than silently skipped every tick.
    pub fn due_alerts(&self, now: DateTime<Utc>) -> EngineResult<Vec<AlertDefinition>> {
        let all = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM alerts WHERE active = 1 ORDER BY last_scanned_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_alert)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut due = Vec::new();
        for alert in all {
            match alert.in_schedule_window(now) {
                Ok(true) if alert.is_due(now) => due.push(alert),
                Ok(_) => {}
                Err(e @ EngineError::ConfigurationInvalid(_)) => {
                    warn!(alert_id = %alert.id, error = %e, "deactivating misconfigured alert");
                    self.deactivate(alert.id, &e.short())?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(due)
    }

    /// Scheduler-only: mark a completed scan.
    pub fn record_scan(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("UPDATE alerts SET last_scanned_at = ?1 WHERE id = ?2")?
            .execute(params![at.timestamp_millis(), id.to_string()])?;
        Ok(())
    }

    /// Scheduler-only: successful delivery bookkeeping.
    pub fn record_dispatch_success(
        &self,
        id: Uuid,
        opportunities: usize,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE alerts SET \
                 total_alerts_sent = total_alerts_sent + 1, \
                 total_opportunities_sent = total_opportunities_sent + ?1, \
                 last_triggered_at = ?2, \
                 consecutive_failures = 0, \
                 last_error = NULL \
             WHERE id = ?3",
        )?
        .execute(params![
            opportunities as i64,
            at.timestamp_millis(),
            id.to_string()
        ])?;
        Ok(())
    }

    /// Scheduler-only: failed delivery bookkeeping. Returns true when the
    /// alert crossed the consecutive-failure limit and was deactivated.
    pub fn record_dispatch_failure(&self, id: Uuid, error: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE alerts SET \
                 total_failed_deliveries = total_failed_deliveries + 1, \
                 consecutive_failures = consecutive_failures + 1, \
                 last_error = ?1 \
             WHERE id = ?2",
        )?
        .execute(params![error, id.to_string()])?;

        let failures: u32 = conn
            .prepare_cached("SELECT consecutive_failures FROM alerts WHERE id = ?1")?
            .query_row(params![id.to_string()], |row| row.get(0))?;

        if failures >= MAX_CONSECUTIVE_FAILURES {
            conn.prepare_cached("UPDATE alerts SET active = 0 WHERE id = ?1")?
                .execute(params![id.to_string()])?;
            warn!(alert_id = %id, failures, "alert auto-deactivated after repeated delivery failures");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn deactivate(&self, id: Uuid, reason: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("UPDATE alerts SET active = 0, last_error = ?1 WHERE id = ?2")?
            .execute(params![reason, id.to_string()])?;
        Ok(())
    }

    /// True when `dispatch_key` was already sent for this alert within the
    /// dedupe window.
    pub fn was_recently_dispatched(
        &self,
        alert_id: Uuid,
        dispatch_key: &str,
        window: Duration,
    ) -> EngineResult<bool> {
        let cutoff = (Utc::now() - window).timestamp_millis();
        let conn = self.conn.lock();
        let hit: Option<i64> = conn
            .prepare_cached(
                "SELECT dispatched_at FROM dispatch_log \
                 WHERE alert_id = ?1 AND dispatch_key = ?2 AND dispatched_at >= ?3",
            )?
            .query_row(params![alert_id.to_string(), dispatch_key, cutoff], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn record_dispatch_key(&self, alert_id: Uuid, dispatch_key: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO dispatch_log (alert_id, dispatch_key, dispatched_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(alert_id, dispatch_key) DO UPDATE SET dispatched_at = excluded.dispatched_at",
        )?
        .execute(params![
            alert_id.to_string(),
            dispatch_key,
            Utc::now().timestamp_millis()
        ])?;
        Ok(())
    }

    pub fn prune_dispatch_log_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM dispatch_log WHERE dispatched_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}

fn weekdays_to_csv(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| match d {
            Weekday::Mon => "mon",
            Weekday::Tue => "tue",
            Weekday::Wed => "wed",
            Weekday::Thu => "thu",
            Weekday::Fri => "fri",
            Weekday::Sat => "sat",
            Weekday::Sun => "sun",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekdays_from_csv(csv: &str) -> Vec<Weekday> {
    csv.split(',')
        .filter_map(|d| match d.trim() {
            "mon" => Some(Weekday::Mon),
            "tue" => Some(Weekday::Tue),
            "wed" => Some(Weekday::Wed),
            "thu" => Some(Weekday::Thu),
            "fri" => Some(Weekday::Fri),
            "sat" => Some(Weekday::Sat),
            "sun" => Some(Weekday::Sun),
            _ => None,
        })
        .collect()
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<AlertDefinition> {
    let ms_to_time = |ms: Option<i64>| {
        ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    };

    Ok(AlertDefinition {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap_or_default(),
        name: row.get("name")?,
        active: row.get::<_, i64>("active")? != 0,
        min_profit_margin: row.get("min_profit_margin")?,
        min_gross_profit: row.get("min_gross_profit")?,
        min_feasibility_score: row.get("min_feasibility_score")?,
        max_risk_level: RiskLevel::parse(&row.get::<_, String>("max_risk_level")?)
            .unwrap_or(RiskLevel::Medium),
        source_allowlist: row
            .get::<_, Option<String>>("source_allowlist")?
            .map(|csv| csv.split(',').map(SourceId::parse).collect()),
        max_buy_price: row.get("max_buy_price")?,
        max_opportunities: row.get::<_, i64>("max_opportunities")? as usize,
        webhook_url: row.get("webhook_url")?,
        notification_config: serde_json::from_str(
            &row.get::<_, String>("notification_config")?,
        )
        .unwrap_or_default(),
        frequency_minutes: row.get::<_, i64>("frequency_minutes")? as u32,
        active_hours_start: row.get::<_, i64>("active_hours_start")? as u8,
        active_hours_end: row.get::<_, i64>("active_hours_end")? as u8,
        active_days: weekdays_from_csv(&row.get::<_, String>("active_days")?),
        timezone: row.get("timezone")?,
        total_alerts_sent: row.get::<_, i64>("total_alerts_sent")? as u64,
        total_opportunities_sent: row.get::<_, i64>("total_opportunities_sent")? as u64,
        total_failed_deliveries: row.get::<_, i64>("total_failed_deliveries")? as u64,
        consecutive_failures: row.get::<_, i64>("consecutive_failures")? as u32,
        last_scanned_at: ms_to_time(row.get("last_scanned_at")?),
        last_triggered_at: ms_to_time(row.get("last_triggered_at")?),
        last_error: row.get("last_error")?,
        version: row.get("version")?,
        created_at: ms_to_time(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}
