//! Health endpoint tests against a broker on the in-memory transport.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bee_worker::build_broker;
use bee_worker::health::{health_router, HealthResponse, HealthState};
use broker::{BrokerConfig, MemoryTransport};
use http_body_util::BodyExt;
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt; // For oneshot()

async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn config() -> BrokerConfig {
    BrokerConfig::new("bee")
        .with_concurrency(2)
        .with_receive_timeout(Duration::from_millis(50))
}

#[tokio::test]
async fn test_ready_follows_broker_lifecycle() {
    let (broker, _state) = build_broker(MemoryTransport::new(), config()).unwrap();
    let app = health_router(HealthState::new(broker.clone(), "bee_worker", "0.1.0"));

    let response = app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["checks"]["broker"], "created");

    broker.worker().await.unwrap();
    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    broker.close().await.unwrap();
    let response = app.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_reports_state_and_workers() {
    let (broker, _state) = build_broker(MemoryTransport::new(), config()).unwrap();
    broker.worker().await.unwrap();
    let app = health_router(HealthState::new(broker.clone(), "bee_worker", "0.1.0"));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = json_body(response.into_body()).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.state, "running");
    assert_eq!(health.link, "connected");
    assert_eq!(health.active_workers, 2);

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_demo_counter_through_broker() {
    let (broker, state) = build_broker(MemoryTransport::new(), config()).unwrap();
    broker.worker().await.unwrap();

    for i in 0..10 {
        broker.send("counter", &i).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.count() < 10 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.count(), 10);

    broker.close().await.unwrap();
}
