//! HTTP server module
//!
//! Provides the Axum-based HTTP server for scrapes and the exporter's own
//! pages. Routes:
//!
//! | Path | |
//! |---|---|
//! | `/` | landing page |
//! | `/healthz` | static `OK` |
//! | `/config` | active configuration, passwords masked |
//! | metrics path (`/metrics`) | one scrape, `?target=<name>` |
//! | `/objserv_exporter_metrics` | self-metrics |
//! | `POST /-/reload` | reload the configuration file |

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::collector::{CollectionEngine, TargetCollector};
use crate::config::ConfigHandle;
use crate::connection::{ConnectionManager, RestConnector};
use crate::metrics::ExporterMetrics;

/// Path of the self-metrics page
pub const SELF_METRICS_PATH: &str = "/objserv_exporter_metrics";

const RESERVED_PATHS: &[&str] = &["/", "/healthz", "/config", "/-/reload", SELF_METRICS_PATH];

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Active configuration
    pub config: Arc<ConfigHandle>,
    /// Scrape entry point
    pub collector: Arc<TargetCollector>,
    /// Connection pools, shared with the collector
    pub manager: Arc<ConnectionManager>,
    /// Self-metrics
    pub metrics: Arc<ExporterMetrics>,
    /// Path serving scrapes
    pub metrics_path: Arc<str>,
}

impl AppState {
    /// Wire up collector and self-metrics around a connection manager
    pub fn new(
        config: Arc<ConfigHandle>,
        manager: Arc<ConnectionManager>,
        metrics_path: impl Into<String>,
    ) -> Self {
        let metrics = Arc::new(ExporterMetrics::new());
        let engine = CollectionEngine::new(Arc::clone(&manager));
        let collector = Arc::new(TargetCollector::new(
            Arc::clone(&config),
            engine,
            Arc::clone(&metrics),
        ));

        Self {
            config,
            collector,
            manager,
            metrics,
            metrics_path: Arc::from(metrics_path.into()),
        }
    }
}

/// Server settings coming from the command line
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_address: SocketAddr,
    pub metrics_path: String,
}

/// Check that the scrape path is usable as a route
pub fn validate_metrics_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        anyhow::bail!("metrics path '{}' must start with '/'", path);
    }
    if RESERVED_PATHS.contains(&path) {
        anyhow::bail!("metrics path '{}' conflicts with a built-in route", path);
    }
    Ok(())
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let metrics_path = state.metrics_path.to_string();

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health))
        .route("/config", get(handlers::config))
        .route(&metrics_path, get(handlers::metrics))
        .route(SELF_METRICS_PATH, get(handlers::self_metrics))
        .route("/-/reload", post(handlers::reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C or SIGTERM
///
/// # Errors
/// Returns an error if the metrics path is invalid or the listener cannot bind
pub async fn run(config: Arc<ConfigHandle>, options: ServerOptions) -> Result<()> {
    validate_metrics_path(&options.metrics_path)?;

    let manager = Arc::new(ConnectionManager::new(RestConnector::new()));
    let state = AppState::new(config, Arc::clone(&manager), options.metrics_path.clone());

    #[cfg(unix)]
    spawn_reload_on_hangup(state.clone());

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(options.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", options.listen_address))?;
    info!(
        address = %options.listen_address,
        metrics_path = %options.metrics_path,
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.close();
    info!("Server shutdown complete");
    Ok(())
}

/// Reload the configuration on SIGHUP
#[cfg(unix)]
fn spawn_reload_on_hangup(state: AppState) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler; reload only via HTTP");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading configuration");
            if let Err(e) = handlers::reload_config(&state) {
                error!(error = %e, "Configuration reload failed; keeping previous configuration");
            }
        }
    });
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
