//! Run Administration Tool
//!
//! Operator CLI for publishing, activating and retiring analysis runs directly
//! against the result database. A running server picks up activations on its
//! next registry refresh.
//!
//! Usage:
//!   cargo run --bin run_admin -- publish --analysis-type clustering --table cluster_assignments --file rows.json --param eps=0.5
//!   cargo run --bin run_admin -- activate --analysis-type clustering --run-id <RUN_ID> --table cluster_assignments
//!   cargo run --bin run_admin -- retire --analysis-type clustering --run-id <RUN_ID>
//!   cargo run --bin run_admin -- active
//!   cargo run --bin run_admin -- runs --analysis-type clustering
//!   cargo run --bin run_admin -- history --analysis-type clustering --limit 20

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use villagescope_backend::{
    analysis::executor::mint_run_id,
    cache::CanonicalParams,
    config::StorageConfig,
    models::{NewRun, ResultRow, ResultTable},
    Database, ResultStore, RunRegistry,
};

/// Publish, activate and retire analysis runs
#[derive(Parser, Debug)]
#[command(name = "run_admin")]
#[command(about = "Manage VillageScope analysis runs and active run ids")]
struct Cli {
    /// Path to the result database
    #[arg(long, env = "DB_PATH", default_value = "villagescope_results.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish rows from a JSON file as a new run
    Publish {
        #[arg(long)]
        analysis_type: String,

        /// Result table the rows go into
        #[arg(long)]
        table: String,

        /// JSON array of {"entity_key": ..., "fields": {...}}
        #[arg(long)]
        file: PathBuf,

        /// Run id (minted when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Computation parameter the rows were produced with, as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,

        /// Activate the run right after publishing
        #[arg(long)]
        activate: bool,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Point an analysis type at a published run
    Activate {
        #[arg(long)]
        analysis_type: String,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        table: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Delete a non-active run's rows
    Retire {
        #[arg(long)]
        analysis_type: String,

        #[arg(long)]
        run_id: String,
    },

    /// Show every active run id
    Active,

    /// List published runs of an analysis type, newest first
    Runs {
        #[arg(long)]
        analysis_type: String,
    },

    /// Show past activations of an analysis type, newest first
    History {
        #[arg(long)]
        analysis_type: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let db = Arc::new(
        Database::open(&StorageConfig::at(&cli.db_path))
            .with_context(|| format!("Failed to open database: {:?}", cli.db_path))?,
    );
    let registry = RunRegistry::open(db.clone())?;
    let store = ResultStore::new(db);

    match cli.command {
        Commands::Publish {
            analysis_type,
            table,
            file,
            run_id,
            params,
            activate,
            notes,
        } => {
            let table = parse_table(&table)?;
            let rows = read_rows(&file)?;
            let params = parse_params(&params)?.computation();
            let run = NewRun {
                run_id: run_id.unwrap_or_else(|| mint_run_id(&analysis_type)),
                analysis_type,
                table,
                params_hash: params.params_hash(),
                parameters: params.into_map(),
            };
            let info = store.publish(&run, &rows)?;
            println!(
                "Published {} ({} rows into {})",
                info.run_id, info.row_count, info.table
            );
            if activate {
                let record = registry.activate(
                    &info.analysis_type,
                    &info.run_id,
                    info.table.as_str(),
                    &actor(),
                    &notes,
                )?;
                println!("Activated {} for {}", record.run_id, record.analysis_type);
            }
        }
        Commands::Activate {
            analysis_type,
            run_id,
            table,
            notes,
        } => {
            let previous = registry.get_active(&analysis_type).ok();
            let record = registry.activate(&analysis_type, &run_id, &table, &actor(), &notes)?;
            match previous {
                Some(prev) => println!(
                    "{}: {} -> {}",
                    record.analysis_type, prev.run_id, record.run_id
                ),
                None => println!("{}: -> {}", record.analysis_type, record.run_id),
            }
        }
        Commands::Retire {
            analysis_type,
            run_id,
        } => {
            let deleted = store.retire(&analysis_type, &run_id)?;
            println!("Retired {} ({} rows deleted)", run_id, deleted);
        }
        Commands::Active => {
            let records = registry.list();
            if records.is_empty() {
                println!("No active runs");
            }
            for r in records {
                println!(
                    "{:<28} {:<48} {:<28} {} by {}",
                    r.analysis_type,
                    r.run_id,
                    r.table_name,
                    r.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    r.updated_by
                );
            }
        }
        Commands::Runs { analysis_type } => {
            let runs = store.list_runs(&analysis_type)?;
            if runs.is_empty() {
                println!("No runs for {}", analysis_type);
            }
            for run in runs {
                println!(
                    "{:<48} {:<9} {:>8} rows  {}  {}",
                    run.run_id,
                    run.status.as_str(),
                    run.row_count,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    serde_json::to_string(&run.parameters)?
                );
            }
        }
        Commands::History {
            analysis_type,
            limit,
        } => {
            for event in registry.history(&analysis_type, limit)? {
                println!(
                    "{}  {} -> {}  by {}  {}",
                    event.activated_at.format("%Y-%m-%d %H:%M:%S"),
                    event.previous_run_id.as_deref().unwrap_or("-"),
                    event.run_id,
                    event.activated_by,
                    event.notes
                );
            }
        }
    }

    Ok(())
}

fn actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .map(|u| format!("cli:{}", u))
        .unwrap_or_else(|| "cli".to_string())
}

fn parse_table(name: &str) -> Result<ResultTable> {
    ResultTable::parse(name).ok_or_else(|| {
        let known: Vec<_> = ResultTable::ALL.iter().map(|t| t.as_str()).collect();
        anyhow!("unknown table '{}' (expected one of: {})", name, known.join(", "))
    })
}

fn parse_params(pairs: &[String]) -> Result<CanonicalParams> {
    let mut params = CanonicalParams::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("parameter '{}' is not key=value", pair);
        };
        params.insert(key, value);
    }
    Ok(params)
}

fn read_rows(path: &PathBuf) -> Result<Vec<ResultRow>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows from {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse rows in {:?}", path))
}
