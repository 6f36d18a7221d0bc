//! Application configuration.
//!
//! Everything is env-driven with sane defaults so the engine can boot with
//! an empty environment. Per-source knobs use `SOURCE_<NAME>_*` variables.

use crate::models::SourceId;
use std::env;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Per-source ingestion settings.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub id: SourceId,
    /// Token-bucket refill rate for outbound API calls.
    pub rate_per_second: f64,
    /// Token-bucket burst capacity.
    pub burst: u32,
    /// Reliability score [0,100] feeding the risk scorer.
    pub reliability: f64,
    /// Pull interval for polling workers.
    pub poll_interval_secs: u64,
    /// Base URL of the upstream feed; empty disables the pull worker.
    pub endpoint: String,
}

impl SourceConfig {
    fn from_env(id: SourceId) -> Self {
        let prefix = format!("SOURCE_{}", id.as_str().to_uppercase());
        Self {
            rate_per_second: env_parse(&format!("{prefix}_RATE_PER_SECOND"), 2.0),
            burst: env_parse(&format!("{prefix}_BURST"), 5),
            reliability: env_parse(&format!("{prefix}_RELIABILITY"), id.default_reliability())
                .clamp(0.0, 100.0),
            poll_interval_secs: env_parse(&format!("{prefix}_POLL_INTERVAL_SECS"), 300),
            endpoint: env::var(format!("{prefix}_ENDPOINT")).unwrap_or_default(),
            id,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub price_db_path: String,
    pub alert_db_path: String,
    pub api_port: u16,
    pub metrics_port: u16,

    pub tick_interval_secs: u64,
    pub worker_pool_size: usize,
    pub queue_capacity: usize,

    pub webhook_timeout_secs: u64,
    pub webhook_max_retries: u32,

    pub demand_lookback_days: u32,
    pub cache_ttl_secs: u64,

    pub history_retention_days: i64,

    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let price_db_path =
            env::var("PRICE_DB_PATH").unwrap_or_else(|_| "./soleflip_prices.db".to_string());
        let alert_db_path =
            env::var("ALERT_DB_PATH").unwrap_or_else(|_| "./soleflip_alerts.db".to_string());

        let sources = SourceId::known()
            .iter()
            .cloned()
            .map(SourceConfig::from_env)
            .collect();

        Ok(Self {
            price_db_path,
            alert_db_path,
            api_port: env_parse("PORT", 3000),
            metrics_port: env_parse("METRICS_PORT", 9090),
            tick_interval_secs: env_parse("SCHEDULER_TICK_INTERVAL_SECONDS", 60),
            worker_pool_size: env_parse("SCHEDULER_WORKER_POOL_SIZE", 8usize).max(1),
            queue_capacity: env_parse("SCHEDULER_QUEUE_CAPACITY", 1024usize).max(1),
            webhook_timeout_secs: env_parse("WEBHOOK_REQUEST_TIMEOUT_SECONDS", 10),
            webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 3),
            demand_lookback_days: env_parse("SCORING_DEMAND_LOOKBACK_DAYS", 90u32).max(1),
            cache_ttl_secs: env_parse("SCORING_CACHE_TTL_SECONDS", 900),
            history_retention_days: env_parse("PRICE_HISTORY_RETENTION_DAYS", 365i64).max(30),
            sources,
        })
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| &s.id == id)
    }

    /// Reliability lookup used by the risk scorer; unknown sources fall back
    /// to their compiled-in default.
    pub fn reliability(&self, id: &SourceId) -> f64 {
        self.source(id)
            .map(|s| s.reliability)
            .unwrap_or_else(|| id.default_reliability())
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults identical to an empty environment.
        Self {
            price_db_path: "./soleflip_prices.db".to_string(),
            alert_db_path: "./soleflip_alerts.db".to_string(),
            api_port: 3000,
            metrics_port: 9090,
            tick_interval_secs: 60,
            worker_pool_size: 8,
            queue_capacity: 1024,
            webhook_timeout_secs: 10,
            webhook_max_retries: 3,
            demand_lookback_days: 90,
            cache_ttl_secs: 900,
            history_retention_days: 365,
            sources: SourceId::known()
                .iter()
                .cloned()
                .map(|id| SourceConfig {
                    rate_per_second: 2.0,
                    burst: 5,
                    reliability: id.default_reliability(),
                    poll_interval_secs: 300,
                    endpoint: String::new(),
                    id,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_known_source() {
        let config = Config::default();
        for id in SourceId::known() {
            assert!(config.source(id).is_some(), "missing config for {id}");
        }
        assert_eq!(config.reliability(&SourceId::Stockx), 95.0);
    }

    #[test]
    fn unknown_source_reliability_falls_back() {
        let config = Config::default();
        let other = SourceId::Other("kickz".to_string());
        assert_eq!(config.reliability(&other), 60.0);
    }
}
