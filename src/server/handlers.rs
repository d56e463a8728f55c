//! HTTP request handlers
//!
//! Scrape failures never turn into HTTP errors: a target that cannot be
//! reached still answers 200 with `up 0`. Only request problems (unknown
//! target, no target) and reload failures do.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{AppState, SELF_METRICS_PATH};
use crate::collector::ScrapeRequest;
use crate::config::MAX_TIMEOUT;
use crate::error::{AppError, AppResult};
use crate::exposition::CONTENT_TYPE;

/// Header carrying the scraper's timeout in seconds
pub const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

/// Query parameters of the metrics path
#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    /// Target to scrape
    pub target: Option<String>,
}

/// Root endpoint - displays basic info
pub async fn root(State(state): State<AppState>) -> Html<String> {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>ObjectServer Exporter</title>
</head>
<body>
    <h1>ObjectServer Exporter</h1>
    <p>Version: {}</p>
    <ul>
        <li><a href="{}">Metrics</a></li>
        <li><a href="{}">Exporter metrics</a></li>
        <li><a href="/config">Configuration</a></li>
        <li><a href="/healthz">Health</a></li>
    </ul>
</body>
</html>"#,
        env!("CARGO_PKG_VERSION"),
        state.metrics_path,
        SELF_METRICS_PATH
    );
    Html(html)
}

/// Health check endpoint; says nothing about ObjectServer reachability
pub async fn health() -> &'static str {
    "OK"
}

/// Active configuration as YAML, passwords masked
pub async fn config(State(state): State<AppState>) -> AppResult<Response> {
    let redacted = state.config.snapshot().redacted();
    let yaml = serde_yaml::to_string(&redacted)
        .map_err(|e| AppError::Internal(format!("failed to render configuration: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], yaml).into_response())
}

/// Metrics endpoint - one scrape of the requested target
#[instrument(skip(state, headers), name = "metrics_handler")]
pub async fn metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let request = ScrapeRequest {
        target: params.target.filter(|t| !t.is_empty()),
        timeout: scrape_timeout_header(&headers),
    };

    let body = state.collector.scrape(&request).await?;
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response())
}

/// Exporter self-metrics
pub async fn self_metrics(State(state): State<AppState>) -> Response {
    state.metrics.update_pools(state.manager.stats());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.metrics.render()).into_response()
}

/// Reload the configuration file
pub async fn reload(State(state): State<AppState>) -> AppResult<Response> {
    reload_config(&state)?;
    Ok((StatusCode::OK, "Configuration reloaded\n").into_response())
}

/// Swap in a freshly loaded configuration and drop pools of removed targets
pub fn reload_config(state: &AppState) -> AppResult<()> {
    let config = state.config.reload()?;
    state
        .manager
        .retain(|name| config.targets.iter().any(|t| t.name == name));
    state.metrics.record_config_reload();
    info!(targets = config.targets.len(), queries = config.queries.len(), "Reload complete");
    Ok(())
}

fn scrape_timeout_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(SCRAPE_TIMEOUT_HEADER)?.to_str().ok()?;
    let parsed = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    match parsed {
        Some(timeout) => Some(timeout.min(MAX_TIMEOUT)),
        None => {
            debug!(value = %raw, "Ignoring invalid scrape timeout header");
            None
        }
    }
}
