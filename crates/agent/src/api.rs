//! HTTP API for health checks, Prometheus metrics and running inputs
//!
//! Paths not handled here are dispatched to the routes inputs registered
//! in the shared [`HttpRegistry`].

use agent_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    http::HttpRegistry,
    models::{InputSummary, KindCrashes},
    observability::AgentMetrics,
    reconcile::Reconciler,
};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub reconciler: Arc<Reconciler>,
    pub http: Arc<HttpRegistry>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        reconciler: Arc<Reconciler>,
        http: Arc<HttpRegistry>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            reconciler,
            http,
        }
    }
}

/// Health check response - returns 200 unless a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Every running input, kinds sorted
async fn list_inputs(State(state): State<Arc<AppState>>) -> Json<Vec<InputSummary>> {
    Json(state.reconciler.snapshot().await)
}

/// Panics recovered per kind since start-up
async fn list_crashes(State(state): State<Arc<AppState>>) -> Json<Vec<KindCrashes>> {
    let mut crashes: Vec<KindCrashes> = state
        .reconciler
        .executor()
        .crash_ledger()
        .snapshot()
        .into_iter()
        .map(|(kind, panics)| KindCrashes { kind, panics })
        .collect();
    crashes.sort_by(|a, b| a.kind.cmp(&b.kind));
    Json(crashes)
}

/// Routes registered by inputs
async fn input_routes(State(state): State<Arc<AppState>>, request: Request) -> Response {
    state.http.dispatch(request).await
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/inputs", get(list_inputs))
        .route("/v1/inputs/crashes", get(list_crashes))
        .fallback(input_routes)
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let health = state.health_registry.clone();
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            health
                .set_unhealthy(components::HTTP, format!("bind {addr}: {e}"))
                .await;
            return Err(e.into());
        }
    };
    axum::serve(listener, app).await?;

    Ok(())
}
