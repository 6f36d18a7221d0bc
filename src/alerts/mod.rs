//! Alert definitions, webhook dispatch, and the background scheduler.

pub mod dispatcher;
pub mod scheduler;
pub mod store;

pub use dispatcher::{build_payload, dispatch_key, WebhookDispatcher};
pub use scheduler::AlertScheduler;
pub use store::{AlertDefinition, AlertStore};
