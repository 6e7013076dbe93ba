//! Analysis definitions
//!
//! What each analysis type is (result kind, backing table, reuse policy) and
//! the seam to the algorithm that computes fresh runs. Algorithms are black
//! boxes: parameters go in, rows come out.

pub mod executor;

pub use executor::AnalysisExecutor;

use crate::cache::CanonicalParams;
use crate::config::{AnalysisConfig, ServiceConfig};
use crate::error::AnalysisError;
use crate::models::{ResultKind, ResultRow, ResultTable};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Whether a request whose computation parameters differ from the active run
/// may be served from another run, or computed into a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Only the active run is ever served.
    ActiveRunOnly,
    /// Active run, else an existing run with the same parameters, else a fresh computation.
    ReuseOrCompute,
}

impl ReusePolicy {
    pub fn default_for(kind: ResultKind) -> Self {
        match kind {
            // Built offline from the full corpus; ad hoc parameter sweeps are not meaningful.
            ResultKind::SemanticNetwork | ResultKind::FeatureExtraction => Self::ActiveRunOnly,
            ResultKind::Clustering
            | ResultKind::Cooccurrence
            | ResultKind::FeatureAggregation
            | ResultKind::SubsetClustering
            | ResultKind::SubsetComparison => Self::ReuseOrCompute,
        }
    }
}

/// Computes the rows of a new run.
#[async_trait]
pub trait AnalysisAlgorithm: Send + Sync {
    async fn run(
        &self,
        analysis_type: &str,
        params: &CanonicalParams,
    ) -> Result<Vec<ResultRow>, AnalysisError>;
}

/// An algorithm implemented by an external program.
///
/// The program gets `{"analysis_type": ..., "parameters": {...}}` on stdin and
/// must print a JSON array of `{"entity_key": ..., "fields": ...}` on stdout.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    /// From argv form. `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[derive(Serialize)]
struct CommandInput<'a> {
    analysis_type: &'a str,
    parameters: &'a BTreeMap<String, String>,
}

#[async_trait]
impl AnalysisAlgorithm for ExternalCommand {
    async fn run(
        &self,
        analysis_type: &str,
        params: &CanonicalParams,
    ) -> Result<Vec<ResultRow>, AnalysisError> {
        let input = serde_json::to_vec(&CommandInput {
            analysis_type,
            parameters: params.as_map(),
        })
        .map_err(|e| AnalysisError::ComputationError(format!("encode input: {}", e)))?;

        debug!(analysis_type, program = %self.program, "Running external algorithm");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AnalysisError::ComputationError(format!("failed to start {}: {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(|e| {
                AnalysisError::ComputationError(format!("failed to write input: {}", e))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            AnalysisError::ComputationError(format!("failed to run {}: {}", self.program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                analysis_type,
                program = %self.program,
                status = %output.status,
                "External algorithm failed"
            );
            return Err(AnalysisError::ComputationError(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let rows: Vec<ResultRow> = serde_json::from_slice(&output.stdout).map_err(|e| {
            AnalysisError::ComputationError(format!("unreadable algorithm output: {}", e))
        })?;
        if rows.is_empty() {
            return Err(AnalysisError::ComputationError(format!(
                "{} produced no rows",
                self.program
            )));
        }
        Ok(rows)
    }
}

/// Everything the executor needs to serve one analysis type.
#[derive(Clone)]
pub struct AnalysisDefinition {
    pub analysis_type: String,
    pub kind: ResultKind,
    pub table: ResultTable,
    pub policy: ReusePolicy,
    /// `None` means the type can only serve runs published out of band.
    pub algorithm: Option<Arc<dyn AnalysisAlgorithm>>,
}

impl AnalysisDefinition {
    /// Kind defaults: default table, default policy, no algorithm.
    pub fn new(analysis_type: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            analysis_type: analysis_type.into(),
            kind,
            table: kind.default_table(),
            policy: ReusePolicy::default_for(kind),
            algorithm: None,
        }
    }

    pub fn with_policy(mut self, policy: ReusePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_table(mut self, table: ResultTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Arc<dyn AnalysisAlgorithm>) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    fn from_config(entry: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let mut def = Self::new(entry.analysis_type.trim(), entry.kind);
        if let Some(policy) = entry.policy {
            def = def.with_policy(policy);
        }
        if let Some(name) = &entry.table {
            let table = ResultTable::parse(name).ok_or_else(|| {
                AnalysisError::InvalidParameters(format!("unknown result table '{}'", name))
            })?;
            def = def.with_table(table);
        }
        if let Some(command) = entry.command.as_deref().and_then(ExternalCommand::from_argv) {
            def = def.with_algorithm(Arc::new(command));
        }
        Ok(def)
    }
}

impl std::fmt::Debug for AnalysisDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisDefinition")
            .field("analysis_type", &self.analysis_type)
            .field("kind", &self.kind)
            .field("table", &self.table)
            .field("policy", &self.policy)
            .field("has_algorithm", &self.algorithm.is_some())
            .finish()
    }
}

/// Registered analysis types, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AnalysisCatalog {
    definitions: BTreeMap<String, AnalysisDefinition>,
}

impl AnalysisCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// One type per `[[analyses]]` entry, or one per result kind when none are configured.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, AnalysisError> {
        let mut catalog = Self::new();
        if config.analyses.is_empty() {
            for kind in ResultKind::ALL {
                catalog.register(AnalysisDefinition::new(kind.as_str(), kind));
            }
        } else {
            for entry in &config.analyses {
                catalog.register(AnalysisDefinition::from_config(entry)?);
            }
        }
        Ok(catalog)
    }

    pub fn register(&mut self, definition: AnalysisDefinition) {
        self.definitions
            .insert(definition.analysis_type.clone(), definition);
    }

    pub fn get(&self, analysis_type: &str) -> Option<&AnalysisDefinition> {
        self.definitions.get(analysis_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_covers_every_kind() {
        let catalog = AnalysisCatalog::from_config(&ServiceConfig::default()).unwrap();
        assert_eq!(catalog.len(), ResultKind::ALL.len());

        let semantic = catalog.get("semantic_network").unwrap();
        assert_eq!(semantic.policy, ReusePolicy::ActiveRunOnly);
        assert_eq!(semantic.table, ResultTable::SemanticNetworkEdges);

        let clustering = catalog.get("clustering").unwrap();
        assert_eq!(clustering.policy, ReusePolicy::ReuseOrCompute);
        assert!(clustering.algorithm.is_none());
    }

    #[test]
    fn test_configured_entries_override_defaults() {
        let mut config = ServiceConfig::default();
        config.analyses.push(AnalysisConfig {
            analysis_type: "clustering_county".into(),
            kind: ResultKind::Clustering,
            policy: Some(ReusePolicy::ActiveRunOnly),
            table: Some("subset_cluster_assignments".into()),
            command: Some(vec!["python3".into(), "cluster.py".into()]),
        });

        let catalog = AnalysisCatalog::from_config(&config).unwrap();
        assert_eq!(catalog.len(), 1);
        let def = catalog.get("clustering_county").unwrap();
        assert_eq!(def.policy, ReusePolicy::ActiveRunOnly);
        assert_eq!(def.table, ResultTable::SubsetClusterAssignments);
        assert!(def.algorithm.is_some());
        assert!(catalog.get("clustering").is_none());
    }

    #[test]
    fn test_external_command_needs_a_program() {
        assert!(ExternalCommand::from_argv(&[]).is_none());
        assert!(ExternalCommand::from_argv(&["echo".to_string()]).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_command_round_trip() {
        let script = r#"cat > /dev/null; echo '[{"entity_key":"village_1","fields":{"cluster":2}}]'"#;
        let command = ExternalCommand::from_argv(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
        .unwrap();

        let rows = command
            .run("clustering", &CanonicalParams::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_key, "village_1");
        assert_eq!(rows[0].fields["cluster"], 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_command_failure_is_computation_error() {
        let command = ExternalCommand::from_argv(&[
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo 'empty dataset' >&2; exit 3".to_string(),
        ])
        .unwrap();
        let err = command
            .run("clustering", &CanonicalParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ComputationError(ref m) if m.contains("empty dataset")));

        let empty = ExternalCommand::from_argv(&[
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo '[]'".to_string(),
        ])
        .unwrap();
        assert!(empty.run("clustering", &CanonicalParams::new()).await.is_err());
    }
}
