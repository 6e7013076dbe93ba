//! HTTP API
//!
//! # Endpoints
//!
//! - `GET /health`
//! - `GET /analysis/:analysis_type?<params>` - analysis result for the active run
//! - `GET /cache/stats`
//! - `/admin/*` - run management, bearer token required (see [`admin`])

pub mod admin;
pub mod analysis;

use crate::analysis::AnalysisExecutor;
use crate::error::AnalysisError;
use crate::middleware::{request_logging, require_admin, AdminToken, ErrorKind};
use crate::models::ErrorResponse;
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<AnalysisExecutor>,
    pub admin_token: AdminToken,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/run-ids/active", get(admin::list_active))
        .route("/run-ids/:analysis_type/activate", post(admin::activate))
        .route("/run-ids/:analysis_type/history", get(admin::history))
        .route("/runs/:analysis_type", get(admin::list_runs))
        .route("/runs/:analysis_type/:run_id/retire", post(admin::retire))
        .route("/cache/clear", post(admin::clear_cache))
        .route("/cache/prime", post(admin::prime_cache))
        .route_layer(middleware::from_fn_with_state(
            state.admin_token.clone(),
            require_admin,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/analysis/:analysis_type", get(analysis::get_analysis))
        .route("/cache/stats", get(analysis::cache_stats))
        .nest("/admin", admin)
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_runs: usize,
    cache_size: usize,
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_runs: state.executor.registry().list().len(),
        cache_size: state.executor.cache().len(),
    })
}

impl IntoResponse for AnalysisError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error_type = self.error_type(), "Request failed: {}", self);
        }
        let body = ErrorResponse::new(self.to_string(), self.error_type());
        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorKind(self.error_type()));
        response
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::app_state;
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = app_state(None);
        let (status, body) = get_json(create_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_runs"], 1);
    }

    #[tokio::test]
    async fn test_analysis_then_cache_hit() {
        let (_dir, state) = app_state(None);
        let app = create_router(state);

        let (status, first) = get_json(app.clone(), "/analysis/clustering?top_k=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["from_cache"], false);
        assert_eq!(first["run_id"], "run_A");
        assert_eq!(first["result_kind"], "ClusteringResult");
        assert_eq!(first["total_rows"], 3);
        assert_eq!(first["rows"].as_array().unwrap().len(), 2);
        assert!(first["execution_time_ms"].as_f64().unwrap() >= 0.0);

        let (_, second) = get_json(app.clone(), "/analysis/clustering?top_k=2").await;
        assert_eq!(second["from_cache"], true);
        assert_eq!(second["rows"], first["rows"]);

        let (status, stats) = get_json(app, "/cache/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["cache_size"], 1);
        assert_eq!(stats["hit_count"], 1);
        assert_eq!(stats["miss_count"], 1);
        assert_eq!(stats["hit_rate"], 0.5);
        assert_eq!(stats["ttl_seconds"], 3_600);
    }

    #[tokio::test]
    async fn test_unknown_type_is_404_with_error_kind() {
        let (_dir, state) = app_state(None);
        let (status, body) = get_json(create_router(state), "/analysis/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_type"], "UnknownAnalysisType");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_error_responses_carry_their_kind_for_logging() {
        let (_dir, state) = app_state(None);
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/analysis/clustering?eps=0.5&EPS=0.6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.extensions().get::<ErrorKind>(),
            Some(&ErrorKind("InvalidParameters"))
        );

        let unknown = AnalysisError::UnknownAnalysisType("x".into()).into_response();
        assert_eq!(
            unknown.extensions().get::<ErrorKind>(),
            Some(&ErrorKind("UnknownAnalysisType"))
        );
    }

    #[tokio::test]
    async fn test_other_parameters_without_algorithm_are_rejected() {
        let (_dir, state) = app_state(None);
        let (status, body) =
            get_json(create_router(state), "/analysis/clustering?eps=0.7").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "InvalidParameters");
    }

    #[test]
    fn test_error_status_mapping() {
        let timeout = AnalysisError::ComputationTimeout {
            fingerprint: "abc".into(),
            waited: std::time::Duration::from_secs(1),
        };
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AnalysisError::RunAlreadyExists("r".into())
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AnalysisError::ComputationError("boom".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
