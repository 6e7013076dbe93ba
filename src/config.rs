//! Service configuration
//!
//! Loaded from TOML (`VILLAGESCOPE_CONFIG`, default `villagescope.toml`), then
//! overridden by environment variables. A missing file falls back to defaults.

use crate::analysis::ReusePolicy;
use crate::models::ResultKind;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Registered analysis types. Empty means one type per result kind, named after the kind.
    #[serde(default)]
    pub analyses: Vec<AnalysisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer token for `/admin` routes. Admin routes answer 403 when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("villagescope_results.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Upper bound a caller waits on somebody else's in-flight computation.
    #[serde(default = "default_computation_timeout_secs")]
    pub computation_timeout_secs: u64,
}

fn default_max_size() -> usize {
    1_000
}

fn default_ttl_seconds() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_computation_timeout_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            ttl_seconds: default_ttl_seconds(),
            sweep_interval_secs: default_sweep_interval_secs(),
            computation_timeout_secs: default_computation_timeout_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn computation_timeout(&self) -> Duration {
        Duration::from_secs(self.computation_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How often the in-memory registry snapshot is re-read from disk.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// One `[[analyses]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub analysis_type: String,
    pub kind: ResultKind,
    /// Overrides the kind's default policy.
    #[serde(default)]
    pub policy: Option<ReusePolicy>,
    /// Overrides the kind's default table; must be a whitelisted name.
    #[serde(default)]
    pub table: Option<String>,
    /// External program that computes fresh runs (argv form).
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists (defaults otherwise), apply env overrides and validate.
    pub fn from_path_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_string("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env_string("ADMIN_TOKEN") {
            self.server.admin_token = Some(v);
        }
        if let Some(v) = env_parse::<usize>("CACHE_MAX_SIZE") {
            self.cache.max_size = v;
        }
        if let Some(v) = env_parse::<u64>("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("COMPUTATION_TIMEOUT_SECS") {
            self.cache.computation_timeout_secs = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.max_size == 0 {
            bail!("cache.max_size must be greater than zero");
        }
        if self.cache.ttl_seconds == 0 {
            bail!("cache.ttl_seconds must be greater than zero");
        }
        if self.cache.computation_timeout_secs == 0 {
            bail!("cache.computation_timeout_secs must be greater than zero");
        }

        let mut seen = HashSet::new();
        for analysis in &self.analyses {
            let name = analysis.analysis_type.trim();
            if name.is_empty() {
                bail!("analyses: analysis_type cannot be empty");
            }
            if !seen.insert(name.to_string()) {
                bail!("analyses: duplicate analysis_type '{}'", name);
            }
            if let Some(table) = &analysis.table {
                if crate::models::ResultTable::parse(table).is_none() {
                    bail!(
                        "analyses: '{}' references unknown table '{}'",
                        name,
                        table
                    );
                }
            }
            if let Some(command) = &analysis.command {
                if command.is_empty() {
                    bail!("analyses: '{}' has an empty command", name);
                }
            }
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert_eq!(config.cache.max_size, 1_000);
        assert_eq!(config.cache.ttl_seconds, 3_600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_analyses() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [cache]
            max_size = 50
            ttl_seconds = 120

            [[analyses]]
            analysis_type = "clustering_county"
            kind = "clustering"
            command = ["python3", "scripts/cluster.py"]

            [[analyses]]
            analysis_type = "semantic_network"
            kind = "semantic_network"
            policy = "active_run_only"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.max_size, 50);
        assert_eq!(config.cache.computation_timeout_secs, 300);
        assert_eq!(config.analyses.len(), 2);
        assert_eq!(config.analyses[0].kind, ResultKind::Clustering);
        assert_eq!(config.analyses[1].policy, Some(ReusePolicy::ActiveRunOnly));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_entries() {
        let mut config = ServiceConfig::default();
        config.cache.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        let entry = AnalysisConfig {
            analysis_type: "clustering".into(),
            kind: ResultKind::Clustering,
            policy: None,
            table: Some("users".into()),
            command: None,
        };
        config.analyses.push(entry);
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        let entry = AnalysisConfig {
            analysis_type: "dup".into(),
            kind: ResultKind::Clustering,
            policy: None,
            table: None,
            command: None,
        };
        config.analyses.push(entry.clone());
        config.analyses.push(entry);
        assert!(config.validate().is_err());
    }
}
