//! Integration tests for the agent API endpoints

use agent_lib::{
    diff::DesiredSet,
    health::{components, HealthRegistry},
    http::HttpRegistry,
    input::Input,
    observability::{AgentMetrics, StructuredLogger},
    reconcile::{Reconciler, ReconcilerConfig, SELF_INPUT},
    supervisor::ExecutorConfig,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use collector_agent::api::{create_router, AppState};
use collector_agent::selfstat::SelfInput;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::with_components().await;
    let metrics = AgentMetrics::new();
    let http = Arc::new(HttpRegistry::new());

    let reconciler = Reconciler::builder()
        .config(ReconcilerConfig {
            executor: ExecutorConfig {
                max_jitter: Duration::ZERO,
                max_crashes: 6,
            },
            ..ReconcilerConfig::default()
        })
        .http(Arc::clone(&http))
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .logger(StructuredLogger::new("test-node"))
        .build()
        .unwrap();

    let state = Arc::new(AppState::new(
        health_registry,
        metrics,
        Arc::new(reconciler),
        http,
    ));
    let router = create_router(state.clone());

    (router, state)
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

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn bootstrap_self_input(state: &AppState) {
    let input = SelfInput::new(
        Arc::clone(state.reconciler.registry()),
        "test-node",
        "0.1.0",
        Duration::from_secs(10),
    );
    let report = state
        .reconciler
        .bootstrap(DesiredSet::new().with(SELF_INPUT, input, "builtin"))
        .await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["reconciler"].is_object());
    assert!(health["components"]["supervisor"].is_object());
    assert!(health["components"]["http"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::SUPERVISOR, "input mysql[0] stopped after 7 crashes")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::HTTP, "bind 0.0.0.0:9529: address in use")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app().await;

    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_reports_reconcile_histogram() {
    let (app, state) = setup_test_app().await;

    state.reconciler.reconcile(DesiredSet::new()).await;

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("collector_agent_reconcile_duration_seconds_bucket"));
    assert!(metrics_text.contains("collector_agent_reconcile_duration_seconds_count"));
    assert!(metrics_text.contains("collector_agent_reconcile_errors_total"));
}

#[tokio::test]
async fn test_inputs_lists_running_instances() {
    let (app, state) = setup_test_app().await;
    bootstrap_self_input(&state).await;

    let (status, inputs) = get_json(app, "/v1/inputs").await;

    assert_eq!(status, StatusCode::OK);
    let inputs = inputs.as_array().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0]["kind"], "self");
    assert_eq!(inputs[0]["index"], 0);
    assert_eq!(inputs[0]["source"], "builtin");
    assert_eq!(inputs[0]["state"], "running");
    assert_eq!(inputs[0]["capabilities"], serde_json::json!(["terminable", "http"]));
}

#[tokio::test]
async fn test_input_routes_served_through_fallback() {
    let (app, state) = setup_test_app().await;

    let (status, _) = get(app.clone(), "/v1/self").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    bootstrap_self_input(&state).await;

    let (status, report) = get_json(app, "/v1/self").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["node"], "test-node");
    assert_eq!(report["version"], "0.1.0");
}

struct AlwaysPanics;

#[async_trait]
impl Input for AlwaysPanics {
    async fn run(&self) {
        panic!("collector bug");
    }

    fn sample_config(&self) -> String {
        String::new()
    }

    fn catalog(&self) -> String {
        "test".to_string()
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

#[tokio::test]
async fn test_crashes_reports_panics_per_kind() {
    let (app, state) = setup_test_app().await;
    state
        .reconciler
        .reconcile(DesiredSet::new().with("broken", AlwaysPanics, "confd"))
        .await;
    assert!(
        state
            .reconciler
            .executor()
            .task_group()
            .wait_idle(Duration::from_secs(5))
            .await
    );

    let (status, crashes) = get_json(app.clone(), "/v1/inputs/crashes").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        crashes,
        serde_json::json!([{ "kind": "broken", "panics": 7 }])
    );

    let (_, inputs) = get_json(app, "/v1/inputs").await;
    assert_eq!(inputs[0]["state"], "exited");
    assert_eq!(inputs[0]["crash_count"], 7);
}
