//! HTTP ingestion service: webhook endpoint plus the worker pool behind it.

mod config;
mod ingest;
mod server;
mod state;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_NOTIFICATION_BODY_MAX_BYTES};
pub use server::run_server;
