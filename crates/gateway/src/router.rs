//! Gateway router and request handlers.

use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Per-request timeout applied to all routes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Standard error body returned on any non-2xx status.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: &'static str,
}

/// Build the gateway [`Router`] with all routes and middleware attached.
pub fn build() -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

/// `GET /health` — liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Catch-all 404 handler.
async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            code: "not_found",
            message: "the requested resource does not exist",
        }),
    )
}
