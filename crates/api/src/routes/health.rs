//! Health check endpoints.

use axum::{http::StatusCode, Json};
use telemetry::{health, metrics};

use crate::response::{HealthResponse, PipelineCounters};

/// GET /health - Full health check.
pub async fn health_handler() -> Json<HealthResponse> {
    let report = health().report();
    let snapshot = metrics().snapshot();

    Json(HealthResponse {
        status: report.status,
        bus_connected: health().bus.is_healthy(),
        warehouse_connected: health().warehouse.is_healthy(),
        components: report.components,
        counters: PipelineCounters::from(&snapshot),
    })
}

/// GET /health/ready - Readiness probe (bus reachable).
pub async fn ready_handler() -> StatusCode {
    if health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live - Liveness probe (process is running).
pub async fn live_handler() -> StatusCode {
    if health().is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
