//! Integration tests for the synthd API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::sync::Arc;
use synth_lib::{
    health::{components, HealthRegistry},
    observability::SynthMetrics,
    ResourceKind,
};
use tower::ServiceExt;

#[allow(dead_code)]
#[path = "../src/api.rs"]
mod api;

use api::{create_router, AppState};

async fn app_with(health_registry: HealthRegistry) -> (Router, Arc<AppState>) {
    let metrics = SynthMetrics::new().unwrap();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry
        .start_replay(&[ResourceKind::Cpu, ResourceKind::Gpu])
        .await;
    app_with(health_registry).await
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["cpu_driver"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::GPU_DRIVER, "4 rows skipped")
        .await;

    // Degraded still returns 200 (replay continues)
    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["gpu_driver"]["message"],
        "4 rows skipped"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::SYNTHESIZER, "Fatal ordering inconsistency")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_replay() {
    let (app, _state) = app_with(HealthRegistry::new()).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["phase"], "not_started");
    assert_eq!(readiness["reason"], "Replay not started");
}

#[tokio::test]
async fn test_readyz_returns_ok_once_replay_started() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
    assert_eq!(readiness["phase"], "running");
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_replay_metrics() {
    let (app, state) = setup_test_app().await;
    state.metrics.inc_records_processed(ResourceKind::Cpu);
    state.metrics.inc_session_event("session-ready");
    state.metrics.set_active_sessions(3);

    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("synth_records_processed_total{kind=\"cpu\"} 1"));
    assert!(text.contains("synth_session_events_total{name=\"session-ready\"} 1"));
    assert!(text.contains("synth_active_sessions 3"));
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = get(app, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
