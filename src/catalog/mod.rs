//! Product catalog collaborator and cross-source matching.

pub mod matcher;
pub mod store;

pub use matcher::ProductMatcher;
pub use store::{InMemoryCatalog, ProductCatalog};
