//! Request logging middleware.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

/// Logs method, path, status and latency of every API call.
///
/// Health probes and the observer socket upgrade are skipped.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" || path == "/ws" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, "request_failed");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "request_completed");
    }

    response
}
