//! Engine error taxonomy.
//!
//! Per-row and per-alert failures are carried as explicit values so one bad
//! source row or webhook never takes down the scheduler or a sibling worker.

use std::time::Duration;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Network error or 5xx from a source or webhook. Retried with backoff.
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    /// 4xx other than 429. Recorded against the offending row/alert, not retried.
    #[error("permanent upstream error ({status}): {message}")]
    PermanentUpstream { status: u16, message: String },

    /// 429 from a source or webhook. Honor Retry-After, treat as transient.
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Contradictory or regressed data. Logged, offending record skipped.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// Persistence failure. Retried once, then propagated.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Alert references an unknown source, malformed timezone, etc.
    /// The alert is auto-deactivated; user action required.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientUpstream(_) | EngineError::RateLimited { .. }
        )
    }

    /// Classify an HTTP response status per the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match status {
            429 => EngineError::RateLimited { retry_after },
            s if s >= 500 => EngineError::TransientUpstream(format!("{s}: {}", message.into())),
            s => EngineError::PermanentUpstream {
                status: s,
                message: message.into(),
            },
        }
    }

    /// Short human-readable form stored in `last_error` on alerts.
    pub fn short(&self) -> String {
        match self {
            EngineError::TransientUpstream(m) => format!("transient: {m}"),
            EngineError::PermanentUpstream { status, message } => {
                format!("upstream {status}: {message}")
            }
            EngineError::RateLimited { .. } => "rate limited".to_string(),
            EngineError::DataIntegrity(m) => format!("data integrity: {m}"),
            EngineError::Storage(e) => format!("storage: {e}"),
            EngineError::ConfigurationInvalid(m) => format!("config: {m}"),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            EngineError::from_status(status.as_u16(), e.to_string(), None)
        } else {
            // Timeouts, connect errors and body errors are all retryable.
            EngineError::TransientUpstream(e.to_string())
        }
    }
}
