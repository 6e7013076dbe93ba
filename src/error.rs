//! Error taxonomy
//!
//! Two layers, mirroring how the rest of the backend separates storage from
//! request handling:
//! - [`StoreError`]: everything the SQLite-backed registry and result store can fail with.
//! - [`AnalysisError`]: the stable, request-level kinds surfaced to API callers.
//!
//! `AnalysisError` is `Clone` because a single in-flight computation hands the
//! same outcome to every caller waiting on it.

use std::time::Duration;

/// Errors from the run registry and result store.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    UnknownAnalysisType(String),
    InvalidRun(String),
    RunAlreadyExists(String),
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::UnknownAnalysisType(t) => write!(f, "Unknown analysis type: {}", t),
            Self::InvalidRun(reason) => write!(f, "Invalid run: {}", reason),
            Self::RunAlreadyExists(id) => write!(f, "Run already exists: {}", id),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Request-level failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// No registry entry (or no definition) for the analysis type. 404.
    UnknownAnalysisType(String),
    /// Activation or retirement referenced a run that cannot be used. 400.
    InvalidRun(String),
    /// Publish collided with an existing run id. 409.
    RunAlreadyExists(String),
    /// A waiter gave up on a shared in-flight computation. 504.
    ComputationTimeout { fingerprint: String, waited: Duration },
    /// The external algorithm failed. 500, never cached.
    ComputationError(String),
    /// Request parameters the analysis type cannot serve. 400.
    InvalidParameters(String),
    /// Durable store failure. 500.
    Storage(String),
}

impl AnalysisError {
    /// Stable kind string used in `ErrorResponse.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownAnalysisType(_) => "UnknownAnalysisType",
            Self::InvalidRun(_) => "InvalidRun",
            Self::RunAlreadyExists(_) => "RunAlreadyExists",
            Self::ComputationTimeout { .. } => "ComputationTimeout",
            Self::ComputationError(_) => "ComputationError",
            Self::InvalidParameters(_) => "InvalidParameters",
            Self::Storage(_) => "StorageError",
        }
    }

    /// HTTP status equivalent.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownAnalysisType(_) => 404,
            Self::InvalidRun(_) | Self::InvalidParameters(_) => 400,
            Self::RunAlreadyExists(_) => 409,
            Self::ComputationTimeout { .. } => 504,
            Self::ComputationError(_) | Self::Storage(_) => 500,
        }
    }
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAnalysisType(t) => write!(f, "Unknown analysis type: {}", t),
            Self::InvalidRun(reason) => write!(f, "Invalid run: {}", reason),
            Self::RunAlreadyExists(id) => write!(f, "Run already exists: {}", id),
            Self::ComputationTimeout { fingerprint, waited } => write!(
                f,
                "Timed out after {}ms waiting for in-flight computation {}",
                waited.as_millis(),
                fingerprint
            ),
            Self::ComputationError(reason) => write!(f, "Computation failed: {}", reason),
            Self::InvalidParameters(reason) => write!(f, "Invalid parameters: {}", reason),
            Self::Storage(reason) => write!(f, "Storage error: {}", reason),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl From<StoreError> for AnalysisError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownAnalysisType(t) => Self::UnknownAnalysisType(t),
            StoreError::InvalidRun(reason) => Self::InvalidRun(reason),
            StoreError::RunAlreadyExists(id) => Self::RunAlreadyExists(id),
            StoreError::NotFound(what) => Self::InvalidRun(format!("{} not found", what)),
            other @ (StoreError::Sqlite(_) | StoreError::Serialization(_)) => {
                Self::Storage(other.to_string())
            }
        }
    }
}
