//! Request logging middleware.
//!
//! One `http_request` span per request carrying the matched route, the analysis
//! type when the route has one, the status and the latency. Failed analysis
//! requests also log the error kind the handler attached to the response, so
//! `InvalidParameters` and `UnknownAnalysisType` show up as distinct events.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{field, info, warn, Instrument};

/// Error kind of a failed response, inserted by the error's `IntoResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorKind(pub &'static str);

const ANALYSIS_PREFIX: &str = "/analysis/";

/// Logs at INFO for 2xx/3xx and 4xx, WARN for 5xx. `/health` is skipped.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let analysis_type = path.strip_prefix(ANALYSIS_PREFIX).unwrap_or("");

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        route = %route,
        analysis_type = field::Empty,
        status = field::Empty,
        latency_ms = field::Empty,
    );
    if !analysis_type.is_empty() {
        span.record("analysis_type", analysis_type);
    }

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let error_type = response
        .extensions()
        .get::<ErrorKind>()
        .map(|kind| kind.0)
        .unwrap_or("-");

    span.record("status", status);
    span.record("latency_ms", latency_ms);
    span.in_scope(|| {
        if status >= 500 {
            warn!(path = %path, status, latency_ms, error_type, "Request failed (5xx)");
        } else if status >= 400 {
            info!(path = %path, status, latency_ms, error_type, "Request rejected (4xx)");
        } else {
            info!(path = %path, status, latency_ms, "Request completed");
        }
    });

    response
}
