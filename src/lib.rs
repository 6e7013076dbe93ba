//! VillageScope Backend Library
//!
//! Run-scoped result cache and active-version registry for expensive analyses.
//! Exposes the core modules for the server binary, the `run_admin` CLI and tests.

pub mod analysis;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod storage;

pub use analysis::{AnalysisCatalog, AnalysisExecutor};
pub use cache::ComputationCache;
pub use config::ServiceConfig;
pub use error::{AnalysisError, StoreError};
pub use storage::{Database, ResultStore, RunRegistry};
