//! HTTP surface tests
//!
//! Drive the router directly with `oneshot`; ObjectServer sessions come from
//! the scripted backend.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use objserv_exporter::config::{Config, ConfigHandle};
use objserv_exporter::connection::ConnectionManager;
use objserv_exporter::exposition::CONTENT_TYPE;
use objserv_exporter::server::{router, AppState, SELF_METRICS_PATH};
use tempfile::NamedTempFile;
use tower::ServiceExt;

use common::{row, sql, MockBackend, MockConnector};

const TWO_TARGETS: &str = r#"
targets:
  - name: T1
    url: http://objectserver-1:8080
    password: hunter2
  - name: T2
    url: http://objectserver-2:8080
queries:
  - name: q1
    sql: "select q1;"
    metric: objserv_alerts
    labels: [labelA]
    value: value
"#;

const ONE_TARGET: &str = r#"
targets:
  - name: T1
    url: http://objectserver-1:8080
queries:
  - name: q1
    sql: "select q1;"
    metric: objserv_alerts
    labels: [labelA]
    value: value
"#;

fn backend() -> Arc<MockBackend> {
    let backend = MockBackend::new();
    backend.rows(&sql("q1"), vec![row("a", "5"), row("b", "7")]);
    backend
}

fn app(config: ConfigHandle, backend: &Arc<MockBackend>) -> (Router, AppState) {
    let manager = Arc::new(ConnectionManager::new(MockConnector(Arc::clone(backend))));
    let state = AppState::new(Arc::new(config), manager, "/metrics");
    (router(state.clone()), state)
}

fn from_yaml(yaml: &str) -> ConfigHandle {
    ConfigHandle::new(Config::from_yaml_str(yaml).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

async fn post(app: &Router, uri: &str) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, _, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_root_links_metrics_path() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, _, body) = get(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("href=\"/metrics\""));
    assert!(body.contains(SELF_METRICS_PATH));
}

#[tokio::test]
async fn test_config_masks_passwords() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, _, body) = get(&app, "/config").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<secret>"));
    assert!(!body.contains("hunter2"));
}

#[tokio::test]
async fn test_scrape_renders_target_label() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, content_type, body) = get(&app, "/metrics?target=T1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some(CONTENT_TYPE));
    assert!(body.contains("objserv_alerts{target=\"T1\",labelA=\"a\"} 5"));
    assert!(body.contains("objserv_alerts{target=\"T1\",labelA=\"b\"} 7"));
    assert!(body.contains("up{target=\"T1\"} 1"));
    assert!(body.contains("scrape_duration_seconds{target=\"T1\"}"));
}

#[tokio::test]
async fn test_unreachable_target_still_answers_200() {
    let backend = backend();
    backend.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend);

    let (status, _, body) = get(&app, "/metrics?target=T2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("up{target=\"T2\"} 0"));
    assert!(!body.contains("objserv_alerts"));
}

#[tokio::test]
async fn test_unknown_target_is_not_found() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, _, _) = get(&app, "/metrics?target=nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_target_is_bad_request() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let (status, _, _) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_single_target_is_default() {
    let (app, _) = app(from_yaml(ONE_TARGET), &backend());
    let (status, _, body) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("up{target=\"T1\"} 1"));
}

#[tokio::test]
async fn test_scrape_timeout_header_is_honoured() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics?target=T1")
                .header("X-Prometheus-Scrape-Timeout-Seconds", "3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_oversized_scrape_timeout_header_is_harmless() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());

    for value in ["1e300", "1e19", "inf", "NaN"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/metrics?target=T1")
                    .header("X-Prometheus-Scrape-Timeout-Seconds", value)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "header value {}", value);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("up{target=\"T1\"} 1"), "header value {}", value);
    }
}

#[tokio::test]
async fn test_self_metrics_count_scrapes() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    get(&app, "/metrics?target=T1").await;
    get(&app, "/metrics?target=T1").await;

    let (status, content_type, body) = get(&app, SELF_METRICS_PATH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some(CONTENT_TYPE));
    assert!(body.contains("objserv_exporter_scrapes_total{target=\"T1\",status=\"success\"} 2"));
    assert!(body.contains("objserv_exporter_pool_connections{target=\"T1\",state=\"open\"} 1"));
    // Scrape output and self-metrics stay separate
    assert!(!body.contains("objserv_alerts"));
}

#[tokio::test]
async fn test_reload_without_file_fails() {
    let (app, _) = app(from_yaml(TWO_TARGETS), &backend());
    assert_eq!(post(&app, "/-/reload").await, StatusCode::INTERNAL_SERVER_ERROR);

    // Previous configuration keeps serving
    let (status, _, _) = get(&app, "/metrics?target=T2").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_reload_drops_removed_targets() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), TWO_TARGETS).unwrap();
    let (app, state) = app(ConfigHandle::load(file.path()).unwrap(), &backend());

    let (status, _, _) = get(&app, "/metrics?target=T2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.manager.stats().iter().any(|(name, _)| name == "T2"));

    std::fs::write(file.path(), ONE_TARGET).unwrap();
    assert_eq!(post(&app, "/-/reload").await, StatusCode::OK);

    assert!(state.manager.stats().iter().all(|(name, _)| name != "T2"));
    let (status, _, _) = get(&app, "/metrics?target=T2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(state.metrics.config_reloads(), 1);
}

#[tokio::test]
async fn test_invalid_reload_keeps_configuration() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), TWO_TARGETS).unwrap();
    let (app, state) = app(ConfigHandle::load(file.path()).unwrap(), &backend());

    std::fs::write(file.path(), "targets: [").unwrap();
    assert_eq!(post(&app, "/-/reload").await, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(state.config.snapshot().targets.len(), 2);
    assert_eq!(state.metrics.config_reloads(), 0);
}
