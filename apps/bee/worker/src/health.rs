//! Health check handlers for the bee worker.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): broker running and link connected
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use broker::{metrics, Broker, Connectivity, LifecycleState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub broker: Broker,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(broker: Broker, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            broker,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" if responding.
    pub status: String,
    pub name: String,
    pub version: String,
    /// Broker lifecycle state.
    pub state: String,
    /// Transport link state.
    pub link: String,
    pub active_workers: usize,
}

/// Liveness probe handler. Always OK while the process serves requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
        state: state.broker.state().as_str().to_string(),
        link: state.broker.connectivity().as_str().to_string(),
        active_workers: state.broker.active_workers(),
    })
}

/// Readiness probe handler.
///
/// Ready once the broker is running and its transport link is up.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let lifecycle = state.broker.state();
    let link = state.broker.connectivity();
    let ready = lifecycle == LifecycleState::Running && link == Connectivity::Connected;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "broker": lifecycle.as_str(),
                "transport": link.as_str(),
            }
        })),
    )
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with every health endpoint.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
