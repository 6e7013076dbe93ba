//! Data Models
//! Registry records, run metadata, result rows and the API DTOs built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The family an analysis type belongs to. Decides the response DTO name,
/// the default result table and the default reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Clustering,
    Cooccurrence,
    SemanticNetwork,
    FeatureExtraction,
    FeatureAggregation,
    SubsetClustering,
    SubsetComparison,
}

impl ResultKind {
    pub const ALL: [ResultKind; 7] = [
        Self::Clustering,
        Self::Cooccurrence,
        Self::SemanticNetwork,
        Self::FeatureExtraction,
        Self::FeatureAggregation,
        Self::SubsetClustering,
        Self::SubsetComparison,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clustering => "clustering",
            Self::Cooccurrence => "cooccurrence",
            Self::SemanticNetwork => "semantic_network",
            Self::FeatureExtraction => "feature_extraction",
            Self::FeatureAggregation => "feature_aggregation",
            Self::SubsetClustering => "subset_clustering",
            Self::SubsetComparison => "subset_comparison",
        }
    }

    /// Name of the response DTO clients see in `result_kind`.
    pub fn dto_name(&self) -> &'static str {
        match self {
            Self::Clustering => "ClusteringResult",
            Self::Cooccurrence => "CooccurrenceResult",
            Self::SemanticNetwork => "SemanticNetworkResult",
            Self::FeatureExtraction => "FeatureExtractionResult",
            Self::FeatureAggregation => "FeatureAggregationResult",
            Self::SubsetClustering => "SubsetClusteringResult",
            Self::SubsetComparison => "SubsetComparisonResult",
        }
    }

    pub fn default_table(&self) -> ResultTable {
        match self {
            Self::Clustering => ResultTable::ClusterAssignments,
            Self::Cooccurrence => ResultTable::CooccurrenceResults,
            Self::SemanticNetwork => ResultTable::SemanticNetworkEdges,
            Self::FeatureExtraction => ResultTable::FeatureVectors,
            Self::FeatureAggregation => ResultTable::FeatureAggregates,
            Self::SubsetClustering => ResultTable::SubsetClusterAssignments,
            Self::SubsetComparison => ResultTable::SubsetComparisons,
        }
    }
}

impl FromStr for ResultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("unknown result kind '{}'", s))
    }
}

/// Whitelisted result tables. These are the only table names that ever reach SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTable {
    ClusterAssignments,
    CooccurrenceResults,
    SemanticNetworkEdges,
    FeatureVectors,
    FeatureAggregates,
    SubsetClusterAssignments,
    SubsetComparisons,
}

impl ResultTable {
    pub const ALL: [ResultTable; 7] = [
        Self::ClusterAssignments,
        Self::CooccurrenceResults,
        Self::SemanticNetworkEdges,
        Self::FeatureVectors,
        Self::FeatureAggregates,
        Self::SubsetClusterAssignments,
        Self::SubsetComparisons,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterAssignments => "cluster_assignments",
            Self::CooccurrenceResults => "cooccurrence_results",
            Self::SemanticNetworkEdges => "semantic_network_edges",
            Self::FeatureVectors => "feature_vectors",
            Self::FeatureAggregates => "feature_aggregates",
            Self::SubsetClusterAssignments => "subset_cluster_assignments",
            Self::SubsetComparisons => "subset_comparisons",
        }
    }

    /// Resolve an untrusted table name against the whitelist.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active pointer for one analysis type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub analysis_type: String,
    pub run_id: String,
    pub table_name: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub notes: String,
}

/// One row of the activation audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub analysis_type: String,
    pub run_id: String,
    pub previous_run_id: Option<String>,
    pub table_name: String,
    pub activated_at: DateTime<Utc>,
    pub activated_by: String,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Staging,
    Complete,
    Retired,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Complete => "complete",
            Self::Retired => "retired",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "staging" => Some(Self::Staging),
            "complete" => Some(Self::Complete),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// Metadata for a published (or retired) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub analysis_type: String,
    pub table: ResultTable,
    pub params_hash: String,
    pub parameters: BTreeMap<String, String>,
    pub status: RunStatus,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

/// A run about to be published.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub analysis_type: String,
    pub run_id: String,
    pub table: ResultTable,
    /// Canonical computation parameters the rows were produced from.
    pub parameters: BTreeMap<String, String>,
    pub params_hash: String,
}

/// One computed output row: the entity it describes plus the algorithm's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub entity_key: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl ResultRow {
    pub fn new(entity_key: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            entity_key: entity_key.into(),
            fields,
        }
    }
}

/// Read-side filter over a run's rows. Rows come back in the order the algorithm produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
    pub entity_prefix: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// What the cache stores for a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub analysis_type: String,
    pub result_kind: String,
    pub run_id: String,
    pub parameters: BTreeMap<String, String>,
    pub total_rows: u64,
    pub rows: Vec<ResultRow>,
}

/// Response body for `GET /analysis/{type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(flatten)]
    pub payload: AnalysisPayload,
    pub from_cache: bool,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_size: usize,
    pub max_size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub error_type: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            error_type: error_type.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub run_id: String,
    pub table_name: String,
    #[serde(default)]
    pub notes: String,
}
