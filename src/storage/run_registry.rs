//! Run Registry
//!
//! Durable mapping from analysis type to its active run and backing table.
//! The registry only moves pointers: a run must already be published and
//! complete before it can be activated.
//!
//! Reads are served from an immutable snapshot swapped in after every commit,
//! so `get_active` never blocks on a writer and never observes half of an
//! activation.

use super::{format_timestamp, parse_timestamp, Database};
use crate::error::StoreError;
use crate::models::{ActivationEvent, ResultTable, RunRecord, RunStatus};
use arc_swap::ArcSwap;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

type Snapshot = BTreeMap<String, Arc<RunRecord>>;

pub struct RunRegistry {
    db: Arc<Database>,
    snapshot: ArcSwap<Snapshot>,
}

impl RunRegistry {
    /// Open the registry and load the current pointers.
    pub fn open(db: Arc<Database>) -> Result<Self, StoreError> {
        let snapshot = {
            let conn = db.reader();
            load_snapshot(&conn)?
        };
        info!("Run registry loaded {} active run(s)", snapshot.len());
        Ok(Self {
            db,
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }

    /// The active run for `analysis_type`.
    pub fn get_active(&self, analysis_type: &str) -> Result<Arc<RunRecord>, StoreError> {
        self.snapshot
            .load()
            .get(analysis_type)
            .cloned()
            .ok_or_else(|| StoreError::UnknownAnalysisType(analysis_type.to_string()))
    }

    /// All active pointers, ordered by analysis type.
    pub fn list(&self) -> Vec<RunRecord> {
        self.snapshot
            .load()
            .values()
            .map(|record| record.as_ref().clone())
            .collect()
    }

    /// Point `analysis_type` at `run_id`.
    ///
    /// The run must exist, be complete, belong to `analysis_type` and live in `table_name`;
    /// otherwise `InvalidRun`. The pointer update and its audit row commit together.
    pub fn activate(
        &self,
        analysis_type: &str,
        run_id: &str,
        table_name: &str,
        actor: &str,
        notes: &str,
    ) -> Result<RunRecord, StoreError> {
        if analysis_type.trim().is_empty() {
            return Err(StoreError::InvalidRun("analysis_type cannot be empty".into()));
        }
        let table = ResultTable::parse(table_name).ok_or_else(|| {
            StoreError::InvalidRun(format!("'{}' is not a known result table", table_name))
        })?;

        let now = format_timestamp(Utc::now());
        let record = {
            let mut conn = self.db.writer();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let run: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT analysis_type, table_name, status FROM analysis_runs WHERE run_id = ?1",
                    [run_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((run_type, run_table, status)) = run else {
                return Err(StoreError::InvalidRun(format!("run {} does not exist", run_id)));
            };
            if run_type != analysis_type {
                return Err(StoreError::InvalidRun(format!(
                    "run {} belongs to {}, not {}",
                    run_id, run_type, analysis_type
                )));
            }
            if run_table != table.as_str() {
                return Err(StoreError::InvalidRun(format!(
                    "run {} is stored in {}, not {}",
                    run_id, run_table, table
                )));
            }
            if RunStatus::from_db(&status) != Some(RunStatus::Complete) {
                return Err(StoreError::InvalidRun(format!(
                    "run {} is {}, only complete runs can be activated",
                    run_id, status
                )));
            }

            let previous: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM active_run_ids WHERE analysis_type = ?1",
                    [analysis_type],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO active_run_ids
                    (analysis_type, run_id, table_name, updated_at, updated_by, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(analysis_type) DO UPDATE SET
                    run_id = excluded.run_id,
                    table_name = excluded.table_name,
                    updated_at = excluded.updated_at,
                    updated_by = excluded.updated_by,
                    notes = excluded.notes",
                params![analysis_type, run_id, table.as_str(), now, actor, notes],
            )?;
            tx.execute(
                "INSERT INTO active_run_history
                    (analysis_type, run_id, previous_run_id, table_name,
                     activated_at, activated_by, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![analysis_type, run_id, previous, table.as_str(), now, actor, notes],
            )?;
            tx.commit()?;

            info!(
                analysis_type,
                run_id,
                previous_run_id = previous.as_deref().unwrap_or("-"),
                actor,
                "Activated run"
            );

            let record = RunRecord {
                analysis_type: analysis_type.to_string(),
                run_id: run_id.to_string(),
                table_name: table.as_str().to_string(),
                updated_at: parse_timestamp(&now),
                updated_by: actor.to_string(),
                notes: notes.to_string(),
            };

            // Still under the writer lock: snapshot order matches commit order.
            let published = Arc::new(record.clone());
            self.snapshot.rcu(|current| {
                let mut next = Snapshot::clone(current);
                next.insert(analysis_type.to_string(), published.clone());
                next
            });
            record
        };
        Ok(record)
    }

    /// Re-read all pointers from disk, picking up activations made by other processes.
    /// Returns the analysis types whose active run changed.
    ///
    /// Runs under the writer lock so an in-process activation cannot commit between
    /// the read and the swap.
    pub fn reload(&self) -> Result<Vec<String>, StoreError> {
        let (previous, current) = {
            let conn = self.db.writer();
            let fresh = Arc::new(load_snapshot(&conn)?);
            (self.snapshot.swap(fresh.clone()), fresh)
        };

        let mut changed: Vec<String> = current
            .iter()
            .filter(|(t, r)| previous.get(*t).map(|p| p.run_id != r.run_id).unwrap_or(true))
            .map(|(t, _)| t.clone())
            .collect();
        changed.extend(
            previous
                .keys()
                .filter(|t| !current.contains_key(*t))
                .cloned(),
        );
        if !changed.is_empty() {
            info!(?changed, "Run registry reloaded with changes");
        } else {
            debug!("Run registry reloaded, no changes");
        }
        Ok(changed)
    }

    /// Past activations of `analysis_type`, newest first.
    pub fn history(
        &self,
        analysis_type: &str,
        limit: usize,
    ) -> Result<Vec<ActivationEvent>, StoreError> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(
            "SELECT analysis_type, run_id, previous_run_id, table_name,
                    activated_at, activated_by, notes
             FROM active_run_history WHERE analysis_type = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![analysis_type, limit as i64], |row| {
                let activated_at: String = row.get(4)?;
                Ok(ActivationEvent {
                    analysis_type: row.get(0)?,
                    run_id: row.get(1)?,
                    previous_run_id: row.get(2)?,
                    table_name: row.get(3)?,
                    activated_at: parse_timestamp(&activated_at),
                    activated_by: row.get(5)?,
                    notes: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn load_snapshot(conn: &Connection) -> Result<Snapshot, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT analysis_type, run_id, table_name, updated_at, updated_by, notes
         FROM active_run_ids ORDER BY analysis_type",
    )?;
    let records = stmt
        .query_map([], |row| {
            let updated_at: String = row.get(3)?;
            Ok(RunRecord {
                analysis_type: row.get(0)?,
                run_id: row.get(1)?,
                table_name: row.get(2)?,
                updated_at: parse_timestamp(&updated_at),
                updated_by: row.get(4)?,
                notes: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records
        .into_iter()
        .map(|r| (r.analysis_type.clone(), Arc::new(r)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRun, ResultRow};
    use crate::storage::test_support::temp_database;
    use crate::storage::ResultStore;
    use serde_json::json;

    fn publish(store: &ResultStore, analysis_type: &str, run_id: &str) {
        let run = NewRun {
            analysis_type: analysis_type.to_string(),
            run_id: run_id.to_string(),
            table: ResultTable::ClusterAssignments,
            parameters: Default::default(),
            params_hash: "h".to_string(),
        };
        store
            .publish(&run, &[ResultRow::new("v1", json!({ "cluster_id": 1 }))])
            .unwrap();
    }

    #[test]
    fn test_activate_then_get_active() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let registry = RunRegistry::open(db).unwrap();
        publish(&store, "clustering_county", "run_A");
        publish(&store, "clustering_county", "run_B");

        registry
            .activate("clustering_county", "run_A", "cluster_assignments", "ops", "first")
            .unwrap();
        let active = registry.get_active("clustering_county").unwrap();
        assert_eq!(active.run_id, "run_A");
        assert_eq!(active.notes, "first");

        registry
            .activate("clustering_county", "run_B", "cluster_assignments", "ops2", "second")
            .unwrap();
        let active = registry.get_active("clustering_county").unwrap();
        assert_eq!(active.run_id, "run_B");
        assert_eq!(active.updated_by, "ops2");
        assert_eq!(active.notes, "second");
        assert_eq!(active.table_name, "cluster_assignments");
    }

    #[test]
    fn test_get_active_unknown_type() {
        let (_dir, db) = temp_database();
        let registry = RunRegistry::open(db).unwrap();
        let err = registry.get_active("clustering_county").unwrap_err();
        assert!(matches!(err, StoreError::UnknownAnalysisType(t) if t == "clustering_county"));
    }

    #[test]
    fn test_activate_rejects_invalid_runs() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let registry = RunRegistry::open(db).unwrap();
        publish(&store, "clustering_county", "run_A");

        let missing = registry.activate("clustering_county", "run_Z", "cluster_assignments", "ops", "");
        assert!(matches!(missing, Err(StoreError::InvalidRun(_))));

        let wrong_table =
            registry.activate("clustering_county", "run_A", "feature_vectors", "ops", "");
        assert!(matches!(wrong_table, Err(StoreError::InvalidRun(_))));

        let unknown_table = registry.activate("clustering_county", "run_A", "users", "ops", "");
        assert!(matches!(unknown_table, Err(StoreError::InvalidRun(_))));

        let wrong_type = registry.activate("cooccurrence", "run_A", "cluster_assignments", "ops", "");
        assert!(matches!(wrong_type, Err(StoreError::InvalidRun(_))));

        store.retire("clustering_county", "run_A").unwrap();
        let retired = registry.activate("clustering_county", "run_A", "cluster_assignments", "ops", "");
        assert!(matches!(retired, Err(StoreError::InvalidRun(_))));

        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_list_is_sorted_and_durable() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::StorageConfig::at(dir.path().join("results.db"));
        {
            let db = Arc::new(Database::open(&config).unwrap());
            let store = ResultStore::new(db.clone());
            let registry = RunRegistry::open(db).unwrap();
            publish(&store, "subset_comparison", "run_S");
            publish(&store, "clustering", "run_C");
            registry.activate("subset_comparison", "run_S", "cluster_assignments", "ops", "").unwrap();
            registry.activate("clustering", "run_C", "cluster_assignments", "ops", "").unwrap();
        }

        let db = Arc::new(Database::open(&config).unwrap());
        let registry = RunRegistry::open(db).unwrap();
        let types: Vec<_> = registry.list().into_iter().map(|r| r.analysis_type).collect();
        assert_eq!(types, vec!["clustering", "subset_comparison"]);
    }

    #[test]
    fn test_reload_sees_activation_from_other_handle() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let serving = RunRegistry::open(db.clone()).unwrap();
        let admin = RunRegistry::open(db).unwrap();
        publish(&store, "clustering", "run_A");

        admin.activate("clustering", "run_A", "cluster_assignments", "cli", "").unwrap();
        assert!(serving.get_active("clustering").is_err());

        let changed = serving.reload().unwrap();
        assert_eq!(changed, vec!["clustering".to_string()]);
        assert_eq!(serving.get_active("clustering").unwrap().run_id, "run_A");
        assert!(serving.reload().unwrap().is_empty());
    }

    #[test]
    fn test_history_records_previous_run() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let registry = RunRegistry::open(db).unwrap();
        publish(&store, "clustering", "run_A");
        publish(&store, "clustering", "run_B");
        registry.activate("clustering", "run_A", "cluster_assignments", "ops", "").unwrap();
        registry.activate("clustering", "run_B", "cluster_assignments", "ops", "rollforward").unwrap();

        let history = registry.history("clustering", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, "run_B");
        assert_eq!(history[0].previous_run_id.as_deref(), Some("run_A"));
        assert_eq!(history[1].previous_run_id, None);
    }

    fn durable_run_id(registry: &RunRegistry, analysis_type: &str) -> String {
        registry
            .db
            .reader()
            .query_row(
                "SELECT run_id FROM active_run_ids WHERE analysis_type = ?1",
                [analysis_type],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_racing_activations_leave_snapshot_equal_to_durable_pointer() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let registry = Arc::new(RunRegistry::open(db).unwrap());
        publish(&store, "clustering", "run_A");
        publish(&store, "clustering", "run_B");

        for _ in 0..200 {
            let barrier = Arc::new(std::sync::Barrier::new(3));
            let handles: Vec<_> = ["run_A", "run_B"]
                .into_iter()
                .map(|run_id| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry
                            .activate("clustering", run_id, "cluster_assignments", "ops", "")
                            .unwrap();
                    })
                })
                .collect();
            let reloader = {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.reload().unwrap();
                })
            };
            for handle in handles {
                handle.join().unwrap();
            }
            reloader.join().unwrap();

            assert_eq!(
                registry.get_active("clustering").unwrap().run_id,
                durable_run_id(&registry, "clustering")
            );
        }
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_records() {
        let (_dir, db) = temp_database();
        let store = ResultStore::new(db.clone());
        let registry = Arc::new(RunRegistry::open(db).unwrap());
        publish(&store, "clustering", "run_A");
        publish(&store, "clustering", "run_B");
        registry.activate("clustering", "run_A", "cluster_assignments", "actor_A", "notes_A").unwrap();

        let reader = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let r = registry.get_active("clustering").unwrap();
                    let suffix = &r.run_id[4..];
                    assert_eq!(r.updated_by, format!("actor_{}", suffix));
                    assert_eq!(r.notes, format!("notes_{}", suffix));
                }
            })
        };
        for i in 0..50 {
            let id = if i % 2 == 0 { "B" } else { "A" };
            registry
                .activate(
                    "clustering",
                    &format!("run_{}", id),
                    "cluster_assignments",
                    &format!("actor_{}", id),
                    &format!("notes_{}", id),
                )
                .unwrap();
        }
        reader.join().unwrap();
    }
}
