//! Exponential backoff with jitter for upstream calls.

use crate::error::{EngineError, EngineResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    /// Fractional jitter applied to each delay (0.2 = +/-20%).
    pub jitter: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            multiplier: 2.0,
            jitter: 0.2,
            cap_ms: 60_000,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Webhook delivery ladder: 1 s, 4 s, 16 s.
    pub fn webhook(max_retries: u32) -> Self {
        Self {
            base_ms: 1_000,
            multiplier: 4.0,
            jitter: 0.0,
            cap_ms: 16_000,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    /// Jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let raw = (self.base_ms as f64 * exp).min(self.cap_ms as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = raw * self.jitter;
            raw + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            raw
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// 429s honor the upstream Retry-After over the computed delay.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = match &e {
                        EngineError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => self.delay(attempt),
                    };
                    debug!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(what, attempts = attempt + 1, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
