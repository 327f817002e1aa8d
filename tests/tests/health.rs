//! Tests for the health endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use telemetry::health;

/// Readiness follows the bus; the full report lists both components.
#[tokio::test]
async fn test_health_endpoints_follow_registry() {
    let server = TestServer::new(api::router()).expect("Failed to create test server");

    health().bus.set_unhealthy("Connection failed");
    health().warehouse.set_healthy();

    let response = server.get("/health/ready").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["bus_connected"], false);
    assert_eq!(body["warehouse_connected"], true);
    assert_eq!(body["components"].as_array().map(Vec::len), Some(2));
    assert!(body["counters"]["exports_succeeded"].as_u64().is_some());

    health().bus.set_healthy();
    server.get("/health/ready").await.assert_status_ok();

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_live_endpoint() {
    let server = TestServer::new(api::router()).expect("Failed to create test server");

    server.get("/health/live").await.assert_status_ok();
}
