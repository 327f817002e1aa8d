//! API routes.

pub mod health;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Creates the health router.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/health/live", get(health::live_handler))
        .layer(TraceLayer::new_for_http())
}
