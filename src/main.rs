//! objserv-exporter - Prometheus exporter for ObjectServer
//!
//! This binary serves scrape results of configured ObjectServer queries
//! on a Prometheus-compatible metrics endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use objserv_exporter::cli::{Cli, LogFormat};
use objserv_exporter::config::ConfigHandle;
use objserv_exporter::server::{self, ServerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    objserv_exporter::init_logging(&cli.log_level.to_string(), cli.log_format == LogFormat::Json)?;

    let config_file = cli.config_file();
    let config = ConfigHandle::load(&config_file)
        .with_context(|| format!("failed to load {}", config_file.display()))?;

    if cli.validate {
        server::validate_metrics_path(&cli.metrics_path)?;
        let snapshot = config.snapshot();
        let usable: usize = snapshot
            .targets
            .iter()
            .map(|t| snapshot.queries_for(t).len())
            .sum();
        println!(
            "Configuration OK: {} target(s), {} query definition(s), {} target queries",
            snapshot.targets.len(),
            snapshot.queries.len(),
            usable
        );
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_file.display(),
        "Starting objserv-exporter"
    );

    server::run(
        Arc::new(config),
        ServerOptions {
            listen_address: cli.listen_address,
            metrics_path: cli.metrics_path,
        },
    )
    .await
}
