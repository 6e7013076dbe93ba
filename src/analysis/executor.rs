//! Analysis Executor
//!
//! Per request: resolve the active run, build the fingerprint, then ask the
//! cache. On a miss the computation decides which run answers the request:
//!
//! 1. Computation parameters empty or equal to the active run's: the active run.
//! 2. Otherwise, under `ReuseOrCompute`, a complete run with the same parameters.
//! 3. Otherwise, under `ReuseOrCompute`, a fresh run from the algorithm, published
//!    but not activated.
//!
//! `ActiveRunOnly` types reject anything but case 1 with `InvalidParameters`.
//! Presentation parameters (`top_k`, `limit`, `offset`, `entity_prefix`) never
//! pick a run, they only slice its rows.
//!
//! The cache only collapses identical fingerprints, and requests that differ in
//! presentation parameters have different fingerprints. Steps 2 and 3 therefore
//! run under a per `(analysis_type, params_hash)` lock, so concurrent requests
//! for the same computation produce one run.

use super::{AnalysisCatalog, AnalysisDefinition, ReusePolicy};
use crate::cache::{CanonicalParams, ComputationCache, Fingerprint};
use crate::error::{AnalysisError, StoreError};
use crate::models::{AnalysisPayload, AnalysisResult, NewRun, RowQuery, RunInfo, RunRecord};
use crate::storage::{ResultStore, RunRegistry};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of warming one analysis type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeOutcome {
    pub analysis_type: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AnalysisExecutor {
    catalog: Arc<AnalysisCatalog>,
    registry: Arc<RunRegistry>,
    store: Arc<ResultStore>,
    cache: ComputationCache,
    run_locks: Arc<RunLocks>,
}

type RunKey = (String, String);

/// One async lock per `(analysis_type, params_hash)` being resolved. Entries are
/// weak, so a key lives only while some task holds or waits on its lock.
#[derive(Default)]
struct RunLocks {
    locks: Mutex<HashMap<RunKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    fn lock_for(&self, analysis_type: &str, params_hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        let key = (analysis_type.to_string(), params_hash.to_string());
        if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}

impl AnalysisExecutor {
    pub fn new(
        catalog: Arc<AnalysisCatalog>,
        registry: Arc<RunRegistry>,
        store: Arc<ResultStore>,
        cache: ComputationCache,
    ) -> Self {
        Self {
            catalog,
            registry,
            store,
            cache,
            run_locks: Arc::new(RunLocks::default()),
        }
    }

    pub fn catalog(&self) -> &AnalysisCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn cache(&self) -> &ComputationCache {
        &self.cache
    }

    /// Serve one request for `analysis_type`.
    pub async fn execute(
        &self,
        analysis_type: &str,
        params: CanonicalParams,
    ) -> Result<AnalysisResult, AnalysisError> {
        let definition = self
            .catalog
            .get(analysis_type)
            .cloned()
            .ok_or_else(|| AnalysisError::UnknownAnalysisType(analysis_type.to_string()))?;
        let active = self.registry.get_active(analysis_type)?;
        let fingerprint = Fingerprint::compute(analysis_type, &params, &active.run_id);

        let started = Instant::now();
        // A payload that no longer decodes is dropped and computed once more.
        for attempt in 0..2 {
            let task = ComputeTask {
                definition: definition.clone(),
                active: active.clone(),
                params: params.clone(),
                store: self.store.clone(),
                run_locks: self.run_locks.clone(),
            };
            let (raw, from_cache) = self
                .cache
                .get_or_compute(&fingerprint, move || task.run())
                .await?;

            match serde_json::from_str::<AnalysisPayload>(&raw) {
                Ok(payload) => {
                    let execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
                    if from_cache {
                        debug!(
                            analysis_type,
                            fingerprint = fingerprint.short(),
                            entry_hits = self.cache.entry_hits(&fingerprint).unwrap_or(0),
                            "Cache hit"
                        );
                    } else {
                        info!(
                            analysis_type,
                            run_id = %payload.run_id,
                            rows = payload.rows.len(),
                            execution_time_ms,
                            "Served computed analysis"
                        );
                    }
                    return Ok(AnalysisResult {
                        payload,
                        from_cache,
                        execution_time_ms,
                    });
                }
                Err(e) => {
                    warn!(
                        analysis_type,
                        fingerprint = fingerprint.short(),
                        attempt,
                        error = %e,
                        "Cached payload failed to decode, recomputing"
                    );
                    self.cache.invalidate(&fingerprint);
                }
            }
        }

        Err(AnalysisError::Storage(format!(
            "payload for {} could not be decoded",
            analysis_type
        )))
    }

    /// Warm the cache with each type's default (parameterless) response.
    pub async fn prime(&self, analysis_types: &[String]) -> Vec<PrimeOutcome> {
        let tasks = analysis_types.iter().map(|analysis_type| async move {
            match self.execute(analysis_type, CanonicalParams::new()).await {
                Ok(result) => PrimeOutcome {
                    analysis_type: analysis_type.clone(),
                    ok: true,
                    run_id: Some(result.payload.run_id),
                    from_cache: result.from_cache,
                    error: None,
                },
                Err(e) => PrimeOutcome {
                    analysis_type: analysis_type.clone(),
                    ok: false,
                    run_id: None,
                    from_cache: false,
                    error: Some(e.to_string()),
                },
            }
        });
        let outcomes = join_all(tasks).await;
        let warmed = outcomes.iter().filter(|o| o.ok).count();
        info!("Primed {}/{} analysis types", warmed, outcomes.len());
        outcomes
    }
}

/// Owned inputs of one cache-miss computation. Runs detached from the request.
struct ComputeTask {
    definition: AnalysisDefinition,
    active: Arc<RunRecord>,
    params: CanonicalParams,
    store: Arc<ResultStore>,
    run_locks: Arc<RunLocks>,
}

impl ComputeTask {
    async fn run(self) -> Result<String, AnalysisError> {
        let analysis_type = self.definition.analysis_type.clone();
        let query = row_query(&self.params)?;
        let run = self.select_run().await?;

        let read_query = query.clone();
        let (rows, total_rows) = blocking({
            let store = self.store.clone();
            let analysis_type = analysis_type.clone();
            let run_id = run.run_id.clone();
            move || store.read_with_total(&analysis_type, &run_id, &read_query)
        })
        .await?;

        let payload = AnalysisPayload {
            analysis_type,
            result_kind: self.definition.kind.dto_name().to_string(),
            run_id: run.run_id,
            parameters: run.parameters,
            total_rows,
            rows,
        };
        serde_json::to_string(&payload)
            .map_err(|e| AnalysisError::Storage(format!("encode payload: {}", e)))
    }

    async fn select_run(&self) -> Result<RunInfo, AnalysisError> {
        let analysis_type = self.definition.analysis_type.as_str();
        let computation = self.params.computation();
        let params_hash = computation.params_hash();

        let active_id = self.active.run_id.clone();
        let active_info = blocking({
            let store = self.store.clone();
            move || store.run_info(&active_id)
        })
        .await?
        .ok_or_else(|| {
            AnalysisError::InvalidRun(format!(
                "active run {} for {} has no published rows",
                self.active.run_id, analysis_type
            ))
        })?;

        if computation.is_empty() || active_info.params_hash == params_hash {
            return Ok(active_info);
        }

        if self.definition.policy == ReusePolicy::ActiveRunOnly {
            return Err(AnalysisError::InvalidParameters(format!(
                "{} only serves its active run {}; computation parameters {} differ from that run's",
                analysis_type,
                self.active.run_id,
                computation.canonical_string()
            )));
        }

        let run_lock = self.run_locks.lock_for(analysis_type, &params_hash);
        let _resolving = run_lock.lock().await;

        let existing = blocking({
            let store = self.store.clone();
            let analysis_type = analysis_type.to_string();
            let params_hash = params_hash.clone();
            move || store.find_complete_run(&analysis_type, &params_hash)
        })
        .await?;
        if let Some(run) = existing {
            info!(analysis_type, run_id = %run.run_id, "Reusing run with matching parameters");
            return Ok(run);
        }

        let algorithm = self.definition.algorithm.clone().ok_or_else(|| {
            AnalysisError::InvalidParameters(format!(
                "no published run of {} matches {} and no algorithm is configured",
                analysis_type,
                computation.canonical_string()
            ))
        })?;

        info!(analysis_type, params_hash = %params_hash, "Computing new run");
        let rows = algorithm.run(analysis_type, &computation).await?;

        let new_run = NewRun {
            analysis_type: analysis_type.to_string(),
            run_id: mint_run_id(analysis_type),
            table: self.definition.table,
            parameters: computation.into_map(),
            params_hash,
        };
        blocking({
            let store = self.store.clone();
            move || store.publish(&new_run, &rows)
        })
        .await
    }
}

/// Run storage work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, AnalysisError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AnalysisError::Storage(format!("storage task failed: {}", e)))?
        .map_err(AnalysisError::from)
}

/// `{analysis_type}_{YYYYMMDDTHHMMSS}_{8 hex}`
pub fn mint_run_id(analysis_type: &str) -> String {
    let slug: String = analysis_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        slug,
        Utc::now().format("%Y%m%dT%H%M%S"),
        &suffix[..8]
    )
}

fn row_query(params: &CanonicalParams) -> Result<RowQuery, AnalysisError> {
    let limit = parse_count(params, "limit")?;
    let top_k = parse_count(params, "top_k")?;
    let limit = match (limit, top_k) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    Ok(RowQuery {
        entity_prefix: params
            .get("entity_prefix")
            .filter(|p| !p.is_empty())
            .map(str::to_string),
        limit,
        offset: parse_count(params, "offset")?.unwrap_or(0),
    })
}

fn parse_count(params: &CanonicalParams, key: &str) -> Result<Option<usize>, AnalysisError> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    match raw.parse::<f64>() {
        Ok(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => Ok(Some(n as usize)),
        _ => Err(AnalysisError::InvalidParameters(format!(
            "{} must be a non-negative integer, got '{}'",
            key, raw
        ))),
    }
}

// =============================================================================
// TESTS
// =============================================================================
