//! Durable storage
//!
//! SQLite database shared by the run registry and the result store. The handle
//! is constructed once by the process entry point and passed to both.
//!
//! Two connections are opened on the same file in WAL mode:
//! - the writer, used for every transaction that mutates state
//! - the reader, used for lookups, so reads never queue behind a long publish
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE active_run_ids (        -- one row per analysis type
//!     analysis_type TEXT PRIMARY KEY,
//!     run_id TEXT NOT NULL,
//!     table_name TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     updated_by TEXT NOT NULL,
//!     notes TEXT NOT NULL
//! );
//! CREATE TABLE analysis_runs (         -- every run ever published
//!     run_id TEXT PRIMARY KEY,
//!     analysis_type TEXT NOT NULL,
//!     table_name TEXT NOT NULL,
//!     params_hash TEXT NOT NULL,
//!     params_json TEXT NOT NULL,
//!     status TEXT NOT NULL,            -- staging | complete | retired
//!     row_count INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     retired_at TEXT
//! );
//! -- plus active_run_history and one partitioned table per ResultTable
//! ```

pub mod result_store;
pub mod run_registry;

pub use result_store::ResultStore;
pub use run_registry::RunRegistry;

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::models::ResultTable;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema version for migrations.
const SCHEMA_VERSION: u32 = 1;

const CORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS active_run_ids (
    analysis_type TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT ''
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS active_run_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    analysis_type TEXT NOT NULL,
    run_id TEXT NOT NULL,
    previous_run_id TEXT,
    table_name TEXT NOT NULL,
    activated_at TEXT NOT NULL,
    activated_by TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_active_run_history_type
    ON active_run_history(analysis_type, id DESC);

CREATE TABLE IF NOT EXISTS analysis_runs (
    run_id TEXT PRIMARY KEY,
    analysis_type TEXT NOT NULL,
    table_name TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    params_json TEXT NOT NULL,
    status TEXT NOT NULL,
    row_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    retired_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_analysis_runs_type
    ON analysis_runs(analysis_type, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_analysis_runs_params
    ON analysis_runs(analysis_type, params_hash, status);
"#;

/// Shared SQLite handle.
pub struct Database {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        let path = config.db_path.clone();
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let writer = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        writer.busy_timeout(busy_timeout)?;
        writer.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        let journal_mode: String = writer
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        initialize_schema(&writer)?;

        // Opened after the schema exists so the reader never sees a half-built database.
        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(busy_timeout)?;

        info!("Result database initialized at: {}", path.display());

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    pub(crate) fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock()
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let current_version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match current_version {
        None => {
            create_schema_v1(conn)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            info!("Created result database schema v{}", SCHEMA_VERSION);
        }
        Some(v) if v == SCHEMA_VERSION => {
            // Idempotent: picks up result tables added to the whitelist since creation.
            create_schema_v1(conn)?;
            debug!("Result database schema at v{}", SCHEMA_VERSION);
        }
        Some(v) => {
            warn!(
                "Result database schema version mismatch: expected {}, got {}",
                SCHEMA_VERSION, v
            );
        }
    }
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CORE_SCHEMA_SQL)?;
    for table in ResultTable::ALL {
        conn.execute_batch(&result_table_ddl(table))?;
    }
    Ok(())
}

/// Every result table has the same shape, partitioned by `run_id`.
fn result_table_ddl(table: ResultTable) -> String {
    let name = table.as_str();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            run_id TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            fields_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (run_id, entity_key)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_{name}_ordinal ON {name}(run_id, ordinal);
        "#
    )
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexicographically.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Unparseable timestamp '{}' in result database: {}", raw, e);
            DateTime::<Utc>::default()
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A database in a fresh temp directory. Keep the `TempDir` alive for the test's duration.
    pub fn temp_database() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&StorageConfig::at(dir.path().join("results.db"))).unwrap();
        (dir, Arc::new(db))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_database;
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let (_dir, db) = temp_database();
        let conn = db.reader();
        let version: u32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        for table in ResultTable::ALL {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table.as_str()],
                    |_| Ok(true),
                )
                .optional()
                .unwrap()
                .unwrap_or(false);
            assert!(exists, "missing table {}", table);
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::at(dir.path().join("results.db"));
        drop(Database::open(&config).unwrap());
        let db = Database::open(&config).unwrap();
        let rows: i64 = db
            .reader()
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
