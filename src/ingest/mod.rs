//! Source ingestion: pull workers, webhook intake, rate limiting, backoff.

pub mod backoff;
pub mod normalize;
pub mod rate_limit;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use rate_limit::TokenBucket;
pub use worker::{HttpSourceFeed, IngestionWorker, SourceFeed, WebhookIngestor};
