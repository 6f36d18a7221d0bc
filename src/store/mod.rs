//! Price persistence.

pub mod price_store;

pub use price_store::{IteratePage, PriceStore, UpsertOutcome, PRICE_EPSILON};
