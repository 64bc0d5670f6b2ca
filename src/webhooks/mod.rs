//! Incoming webhooks and the HTTP router.

pub mod ingest;
pub mod model;
pub mod routes;

pub use ingest::{IngestDeps, WebhookIngestor};
pub use routes::{AppState, router};
