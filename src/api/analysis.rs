//! Public analysis endpoints.

use super::AppState;
use crate::cache::CanonicalParams;
use crate::error::AnalysisError;
use crate::models::{AnalysisResult, CacheStats};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use std::collections::HashMap;

/// GET /analysis/:analysis_type - result for the active run, sliced by presentation params
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<AnalysisResult>, AnalysisError> {
    let params = CanonicalParams::from_query(&query)?;
    let result = state.executor.execute(&analysis_type, params).await?;
    Ok(Json(result))
}

/// GET /cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.executor.cache().stats())
}
