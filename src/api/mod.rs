//! Read-only HTTP surface plus the inbound webhook intake.

pub mod routes;

pub use routes::{router, ApiState};
