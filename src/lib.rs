//! objserv-exporter library
//!
//! This crate provides the core functionality for scraping ObjectServer
//! instances with configured SQL queries and exporting the results in
//! Prometheus format.

pub mod cli;
pub mod collector;
pub mod config;
pub mod connection;
pub mod error;
pub mod exposition;
pub mod metrics;
pub mod server;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging subsystem
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error); `RUST_LOG` wins when set
/// * `json` - Emit one JSON object per event instead of text lines
///
/// # Errors
/// Returns an error if the logging system fails to initialize
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
