//! Admin endpoints
//!
//! Operator control over which run each analysis type serves.
//!
//! - `GET  /admin/run-ids/active` - every active pointer
//! - `POST /admin/run-ids/:analysis_type/activate` - point a type at a published run
//! - `GET  /admin/run-ids/:analysis_type/history` - past activations, newest first
//! - `GET  /admin/runs/:analysis_type` - published runs, newest first
//! - `POST /admin/runs/:analysis_type/:run_id/retire` - delete a non-active run's rows
//! - `POST /admin/cache/clear`
//! - `POST /admin/cache/prime` - optional body `{"analysis_types": [...]}`
//!
//! Activation does not touch the cache: fingerprints embed the active run id,
//! so entries built against the previous run simply stop being addressed.

use super::AppState;
use crate::analysis::executor::PrimeOutcome;
use crate::error::AnalysisError;
use crate::models::{ActivateRequest, ActivationEvent, RunInfo, RunRecord};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Header naming who performed an admin action, recorded in the audit trail.
const ACTOR_HEADER: &str = "x-actor";

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("api")
        .to_string()
}

/// GET /admin/run-ids/active
pub async fn list_active(State(state): State<AppState>) -> Json<Vec<RunRecord>> {
    Json(state.executor.registry().list())
}

/// POST /admin/run-ids/:analysis_type/activate
pub async fn activate(
    State(state): State<AppState>,
    Path(analysis_type): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<RunRecord>, AnalysisError> {
    let actor = actor(&headers);
    let record = state.executor.registry().activate(
        &analysis_type,
        req.run_id.trim(),
        req.table_name.trim(),
        &actor,
        &req.notes,
    )?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /admin/run-ids/:analysis_type/history
pub async fn history(
    State(state): State<AppState>,
    Path(analysis_type): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ActivationEvent>>, AnalysisError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let events = state.executor.registry().history(&analysis_type, limit)?;
    Ok(Json(events))
}

/// GET /admin/runs/:analysis_type
pub async fn list_runs(
    State(state): State<AppState>,
    Path(analysis_type): Path<String>,
) -> Result<Json<Vec<RunInfo>>, AnalysisError> {
    Ok(Json(state.executor.store().list_runs(&analysis_type)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetireResponse {
    pub analysis_type: String,
    pub run_id: String,
    pub rows_deleted: u64,
}

/// POST /admin/runs/:analysis_type/:run_id/retire
pub async fn retire(
    State(state): State<AppState>,
    Path((analysis_type, run_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RetireResponse>, AnalysisError> {
    let rows_deleted = state.executor.store().retire(&analysis_type, &run_id)?;
    info!(
        analysis_type = %analysis_type,
        run_id = %run_id,
        actor = %actor(&headers),
        "Run retired via admin API"
    );
    Ok(Json(RetireResponse {
        analysis_type,
        run_id,
        rows_deleted,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub cleared: usize,
}

/// POST /admin/cache/clear
pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearCacheResponse> {
    Json(ClearCacheResponse {
        cleared: state.executor.cache().clear(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct PrimeRequest {
    #[serde(default)]
    pub analysis_types: Option<Vec<String>>,
}

/// POST /admin/cache/prime - every registered type unless the body names some
pub async fn prime_cache(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<PrimeOutcome>>, AnalysisError> {
    let req: PrimeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PrimeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AnalysisError::InvalidParameters(format!("invalid prime request: {}", e)))?
    };

    let types = req.analysis_types.unwrap_or_else(|| {
        state
            .executor
            .catalog()
            .types()
            .map(str::to_string)
            .collect()
    });
    Ok(Json(state.executor.prime(&types).await))
}

#[cfg(test)]
mod tests {
    use crate::api::create_router;
    use crate::api::test_support::{app_state, publish, TOKEN};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(
        app: Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-actor", "ops@villagescope")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let (_dir, state) = app_state(None);
        let (status, _) = send(
            create_router(state),
            Method::GET,
            "/admin/run-ids/active",
            Some("anything"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_requires_matching_token() {
        let (_dir, state) = app_state(Some(TOKEN));
        let app = create_router(state);

        let (status, _) = send(app.clone(), Method::GET, "/admin/run-ids/active", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(app.clone(), Method::GET, "/admin/run-ids/active", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            send(app, Method::GET, "/admin/run-ids/active", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["analysis_type"], "clustering");
        assert_eq!(body[0]["run_id"], "run_A");
    }

    #[tokio::test]
    async fn test_activate_switches_served_run_and_records_history() {
        let (_dir, state) = app_state(Some(TOKEN));
        let app = create_router(state);

        let (_, before) = send(app.clone(), Method::GET, "/analysis/clustering", None, None).await;
        assert_eq!(before["run_id"], "run_A");

        let (status, record) = send(
            app.clone(),
            Method::POST,
            "/admin/run-ids/clustering/activate",
            Some(TOKEN),
            Some(json!({ "run_id": "run_B", "table_name": "cluster_assignments", "notes": "rerun" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["run_id"], "run_B");
        assert_eq!(record["updated_by"], "ops@villagescope");

        let (_, after) = send(app.clone(), Method::GET, "/analysis/clustering", None, None).await;
        assert_eq!(after["run_id"], "run_B");
        assert_eq!(after["from_cache"], false);
        assert_eq!(after["total_rows"], 5);

        let (status, history) = send(
            app,
            Method::GET,
            "/admin/run-ids/clustering/history?limit=10",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["run_id"], "run_B");
        assert_eq!(history[0]["previous_run_id"], "run_A");
    }

    #[tokio::test]
    async fn test_activate_rejects_bad_runs() {
        let (_dir, state) = app_state(Some(TOKEN));
        let app = create_router(state);

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/admin/run-ids/clustering/activate",
            Some(TOKEN),
            Some(json!({ "run_id": "run_missing", "table_name": "cluster_assignments" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "InvalidRun");

        let (status, _) = send(
            app,
            Method::POST,
            "/admin/run-ids/clustering/activate",
            Some(TOKEN),
            Some(json!({ "run_id": "run_B", "table_name": "users; DROP TABLE x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retire_refuses_active_and_removes_inactive() {
        let (_dir, state) = app_state(Some(TOKEN));
        publish(state.executor.store(), "clustering", "run_C", 2);
        let app = create_router(state);

        let (status, _) = send(
            app.clone(),
            Method::POST,
            "/admin/runs/clustering/run_A/retire",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/admin/runs/clustering/run_C/retire",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows_deleted"], 2);

        let (status, runs) =
            send(app, Method::GET, "/admin/runs/clustering", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        let retired = runs
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["run_id"] == "run_C")
            .unwrap();
        assert_eq!(retired["status"], "retired");
    }

    #[tokio::test]
    async fn test_prime_then_clear() {
        let (_dir, state) = app_state(Some(TOKEN));
        let app = create_router(state);

        let (status, outcomes) =
            send(app.clone(), Method::POST, "/admin/cache/prime", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcomes[0]["analysis_type"], "clustering");
        assert_eq!(outcomes[0]["ok"], true);

        let (_, warm) = send(app.clone(), Method::GET, "/analysis/clustering", None, None).await;
        assert_eq!(warm["from_cache"], true);

        let (status, cleared) =
            send(app, Method::POST, "/admin/cache/clear", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["cleared"], 1);
    }
}
