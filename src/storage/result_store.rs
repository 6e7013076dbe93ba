//! Result Store
//!
//! Run-tagged, append-only storage for analysis outputs. Once a run is
//! published its rows are never modified, only read or retired as a whole.
//!
//! Publishing is stage-then-publish inside one write transaction: the run is
//! recorded as `staging`, its rows are inserted, then it is flipped to
//! `complete`. Readers only ever see `complete` runs, so a run is either fully
//! visible or not visible at all.

use super::{format_timestamp, parse_timestamp, Database};
use crate::error::StoreError;
use crate::models::{NewRun, ResultRow, ResultTable, RowQuery, RunInfo, RunStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Longest run id accepted.
const MAX_RUN_ID_LEN: usize = 128;

const RUN_COLUMNS: &str = "run_id, analysis_type, table_name, params_hash, params_json, \
                           status, row_count, created_at, retired_at";

/// Raw `analysis_runs` row before whitelist/enum conversion.
struct RunRow {
    run_id: String,
    analysis_type: String,
    table_name: String,
    params_hash: String,
    params_json: String,
    status: String,
    row_count: i64,
    created_at: String,
    retired_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            analysis_type: row.get(1)?,
            table_name: row.get(2)?,
            params_hash: row.get(3)?,
            params_json: row.get(4)?,
            status: row.get(5)?,
            row_count: row.get(6)?,
            created_at: row.get(7)?,
            retired_at: row.get(8)?,
        })
    }

    fn into_info(self) -> Result<RunInfo, StoreError> {
        let table = ResultTable::parse(&self.table_name).ok_or_else(|| {
            StoreError::InvalidRun(format!(
                "run {} references unknown table '{}'",
                self.run_id, self.table_name
            ))
        })?;
        let status = RunStatus::from_db(&self.status).ok_or_else(|| {
            StoreError::InvalidRun(format!(
                "run {} has unknown status '{}'",
                self.run_id, self.status
            ))
        })?;
        let parameters: BTreeMap<String, String> = serde_json::from_str(&self.params_json)?;

        Ok(RunInfo {
            run_id: self.run_id,
            analysis_type: self.analysis_type,
            table,
            params_hash: self.params_hash,
            parameters,
            status,
            row_count: self.row_count.max(0) as u64,
            created_at: parse_timestamp(&self.created_at),
            retired_at: self.retired_at.as_deref().map(parse_timestamp),
        })
    }
}

/// Storage for published analysis runs.
pub struct ResultStore {
    db: Arc<Database>,
}

impl ResultStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Publish all rows of a run as one atomic unit.
    ///
    /// Fails with `RunAlreadyExists` if the run id was ever used before, including by a
    /// run that has since been retired.
    pub fn publish(&self, run: &NewRun, rows: &[ResultRow]) -> Result<RunInfo, StoreError> {
        validate_run_id(&run.run_id)?;
        if run.analysis_type.trim().is_empty() {
            return Err(StoreError::InvalidRun("analysis_type cannot be empty".into()));
        }
        if rows.is_empty() {
            return Err(StoreError::InvalidRun(format!(
                "run {} has no rows to publish",
                run.run_id
            )));
        }
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if !seen.insert(row.entity_key.as_str()) {
                return Err(StoreError::InvalidRun(format!(
                    "run {} contains duplicate entity_key '{}'",
                    run.run_id, row.entity_key
                )));
            }
        }

        // Pre-serialize outside the lock
        let params_json = serde_json::to_string(&run.parameters)?;
        let serialized: Vec<(&str, String)> = rows
            .iter()
            .map(|r| serde_json::to_string(&r.fields).map(|f| (r.entity_key.as_str(), f)))
            .collect::<Result<_, _>>()?;
        let created_at = Utc::now();
        let created_at_str = format_timestamp(created_at);

        let mut conn = self.db.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM analysis_runs WHERE run_id = ?1",
                [&run.run_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if exists {
            return Err(StoreError::RunAlreadyExists(run.run_id.clone()));
        }

        tx.execute(
            "INSERT INTO analysis_runs (run_id, analysis_type, table_name, params_hash,
                params_json, status, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                run.run_id,
                run.analysis_type,
                run.table.as_str(),
                run.params_hash,
                params_json,
                RunStatus::Staging.as_str(),
                created_at_str,
            ],
        )?;

        {
            let sql = format!(
                "INSERT INTO {} (run_id, entity_key, ordinal, fields_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                run.table.as_str()
            );
            let mut stmt = tx.prepare(&sql)?;
            for (ordinal, (entity_key, fields_json)) in serialized.iter().enumerate() {
                stmt.execute(params![
                    run.run_id,
                    entity_key,
                    ordinal as i64,
                    fields_json,
                    created_at_str,
                ])?;
            }
        }

        tx.execute(
            "UPDATE analysis_runs SET status = ?1, row_count = ?2 WHERE run_id = ?3",
            params![
                RunStatus::Complete.as_str(),
                rows.len() as i64,
                run.run_id
            ],
        )?;
        tx.commit()?;

        info!(
            analysis_type = %run.analysis_type,
            run_id = %run.run_id,
            table = %run.table,
            rows = rows.len(),
            "Published analysis run"
        );

        Ok(RunInfo {
            run_id: run.run_id.clone(),
            analysis_type: run.analysis_type.clone(),
            table: run.table,
            params_hash: run.params_hash.clone(),
            parameters: run.parameters.clone(),
            status: RunStatus::Complete,
            row_count: rows.len() as u64,
            created_at: parse_timestamp(&created_at_str),
            retired_at: None,
        })
    }

    /// Read rows of a complete run, in the order the algorithm produced them.
    pub fn read(
        &self,
        analysis_type: &str,
        run_id: &str,
        query: &RowQuery,
    ) -> Result<Vec<ResultRow>, StoreError> {
        let conn = self.db.reader();
        let run = complete_run(&conn, analysis_type, run_id)?;
        let rows = select_rows(&conn, &run, query)?;
        debug!(analysis_type, run_id, rows = rows.len(), "Read run rows");
        Ok(rows)
    }

    /// Number of rows in a complete run matching the query's entity prefix.
    pub fn count(
        &self,
        analysis_type: &str,
        run_id: &str,
        entity_prefix: Option<&str>,
    ) -> Result<u64, StoreError> {
        let conn = self.db.reader();
        let run = complete_run(&conn, analysis_type, run_id)?;
        count_rows(&conn, &run, entity_prefix)
    }

    /// One page of rows plus the total matching the prefix, read from a single
    /// snapshot so a concurrent `retire` cannot land between the two.
    pub fn read_with_total(
        &self,
        analysis_type: &str,
        run_id: &str,
        query: &RowQuery,
    ) -> Result<(Vec<ResultRow>, u64), StoreError> {
        let mut conn = self.db.reader();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let run = complete_run(&tx, analysis_type, run_id)?;
        let rows = select_rows(&tx, &run, query)?;
        let total = count_rows(&tx, &run, query.entity_prefix.as_deref())?;
        tx.finish()?;
        debug!(analysis_type, run_id, rows = rows.len(), total, "Read run page");
        Ok((rows, total))
    }

    /// Remove a run's rows entirely. The run id stays reserved.
    ///
    /// Refuses to retire the run an analysis type currently points at.
    pub fn retire(&self, analysis_type: &str, run_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.db.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let run = complete_run(&tx, analysis_type, run_id)?;

        let active_for: Option<String> = tx
            .query_row(
                "SELECT analysis_type FROM active_run_ids WHERE run_id = ?1 LIMIT 1",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active_type) = active_for {
            return Err(StoreError::InvalidRun(format!(
                "run {} is the active run for {}; activate another run first",
                run_id, active_type
            )));
        }

        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE run_id = ?1", run.table.as_str()),
            [run_id],
        )?;
        tx.execute(
            "UPDATE analysis_runs SET status = ?1, retired_at = ?2 WHERE run_id = ?3",
            params![
                RunStatus::Retired.as_str(),
                format_timestamp(Utc::now()),
                run_id
            ],
        )?;
        tx.commit()?;

        info!(analysis_type, run_id, rows = deleted, "Retired analysis run");
        Ok(deleted as u64)
    }

    /// Metadata for any run id, whatever its status.
    pub fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>, StoreError> {
        let conn = self.db.reader();
        load_run(&conn, run_id)?.map(RunRow::into_info).transpose()
    }

    /// All runs of an analysis type, newest first, retired runs included.
    pub fn list_runs(&self, analysis_type: &str) -> Result<Vec<RunInfo>, StoreError> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM analysis_runs WHERE analysis_type = ?1
             ORDER BY created_at DESC, run_id DESC"
        ))?;
        let rows: Vec<RunRow> = stmt
            .query_map([analysis_type], RunRow::from_row)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(RunRow::into_info).collect()
    }

    /// Newest complete run of `analysis_type` computed from exactly these parameters.
    pub fn find_complete_run(
        &self,
        analysis_type: &str,
        params_hash: &str,
    ) -> Result<Option<RunInfo>, StoreError> {
        let conn = self.db.reader();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM analysis_runs
                     WHERE analysis_type = ?1 AND params_hash = ?2 AND status = ?3
                     ORDER BY created_at DESC, run_id DESC LIMIT 1"
                ),
                params![analysis_type, params_hash, RunStatus::Complete.as_str()],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_info).transpose()
    }
}

fn load_run(conn: &Connection, run_id: &str) -> Result<Option<RunRow>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM analysis_runs WHERE run_id = ?1"),
            [run_id],
            RunRow::from_row,
        )
        .optional()?)
}

/// Resolve a run that belongs to `analysis_type` and is fully published.
fn select_rows(conn: &Connection, run: &RunInfo, query: &RowQuery) -> Result<Vec<ResultRow>, StoreError> {
    let sql = format!(
        "SELECT entity_key, fields_json FROM {}
         WHERE run_id = ?1 AND (?2 IS NULL OR substr(entity_key, 1, length(?2)) = ?2)
         ORDER BY ordinal ASC LIMIT ?3 OFFSET ?4",
        run.table.as_str()
    );
    let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&sql)?;
    let raw: Vec<(String, String)> = stmt
        .query_map(
            params![run.run_id, query.entity_prefix, limit, query.offset as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<Result<_, _>>()?;

    let rows = raw
        .into_iter()
        .map(|(entity_key, fields_json)| {
            serde_json::from_str(&fields_json).map(|fields| ResultRow { entity_key, fields })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn count_rows(conn: &Connection, run: &RunInfo, entity_prefix: Option<&str>) -> Result<u64, StoreError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}
         WHERE run_id = ?1 AND (?2 IS NULL OR substr(entity_key, 1, length(?2)) = ?2)",
        run.table.as_str()
    );
    let count: i64 = conn.query_row(&sql, params![run.run_id, entity_prefix], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

fn complete_run(conn: &Connection, analysis_type: &str, run_id: &str) -> Result<RunInfo, StoreError> {
    let run = load_run(conn, run_id)?
        .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?
        .into_info()?;
    if run.analysis_type != analysis_type {
        return Err(StoreError::InvalidRun(format!(
            "run {} belongs to {}, not {}",
            run_id, run.analysis_type, analysis_type
        )));
    }
    match run.status {
        RunStatus::Complete => Ok(run),
        RunStatus::Staging => Err(StoreError::NotFound(format!("run {}", run_id))),
        RunStatus::Retired => Err(StoreError::InvalidRun(format!(
            "run {} has been retired",
            run_id
        ))),
    }
}

fn validate_run_id(run_id: &str) -> Result<(), StoreError> {
    if run_id.is_empty() || run_id.len() > MAX_RUN_ID_LEN {
        return Err(StoreError::InvalidRun(format!(
            "run id must be 1..={} characters",
            MAX_RUN_ID_LEN
        )));
    }
    if !run_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(StoreError::InvalidRun(format!(
            "run id '{}' may only contain ASCII letters, digits, '_', '-' and '.'",
            run_id
        )));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
