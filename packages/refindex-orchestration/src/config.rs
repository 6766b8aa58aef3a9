//! Reconciliation configuration (YAML)
//!
//! ```yaml
//! version: 1
//! database: ./site.db
//! index_table: sys_refindex
//! id_column: uid
//! update_all_tables: false
//! selected_tables: [tt_content]
//! max_concurrent_tables: 2
//! table_timeout_ms: 30000
//! delete_batch_size: 500
//! sweep_scope: working_set
//! tables:
//!   tt_content:
//!     references:
//!       - { field: pid, target: pages }
//!   pages: {}
//! ```

use refindex_storage::domain::validate_identifier;
use refindex_storage::{IndexLayout, StorageError, TableName, TableRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 500;
/// Stays below SQLite's host parameter limit (32766) with room for the table name
pub const MAX_DELETE_BATCH_SIZE: usize = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u64, supported: Vec<u32> },

    #[error("Invalid value for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid identifier: {0}")]
    Identifier(#[from] StorageError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which index rows the final sweep keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepScope {
    /// Keep only rows of tables reconciled in this run
    #[default]
    WorkingSet,
    /// Keep rows of every eligible table, remove only unregistered tables
    Eligible,
}

/// Knobs of a single reconciliation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_concurrent_tables: usize,
    pub table_timeout: Option<Duration>,
    pub delete_batch_size: usize,
    pub sweep_scope: SweepScope,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent_tables: 1,
            table_timeout: None,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            sweep_scope: SweepScope::WorkingSet,
        }
    }
}

fn default_index_table() -> String {
    refindex_storage::infrastructure::sqlite::DEFAULT_INDEX_TABLE.to_string()
}

fn default_id_column() -> String {
    refindex_storage::infrastructure::sqlite::DEFAULT_ID_COLUMN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

fn default_batch_size() -> usize {
    DEFAULT_DELETE_BATCH_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,

    #[serde(default = "default_index_table")]
    pub index_table: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_true")]
    pub update_all_tables: bool,

    #[serde(default)]
    pub selected_tables: Vec<TableName>,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_tables: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_timeout_ms: Option<u64>,

    #[serde(default = "default_batch_size")]
    pub delete_batch_size: usize,

    #[serde(default)]
    pub sweep_scope: SweepScope,

    #[serde(default)]
    pub tables: TableRegistry,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            version: 1,
            database: None,
            index_table: default_index_table(),
            id_column: default_id_column(),
            update_all_tables: true,
            selected_tables: Vec::new(),
            max_concurrent_tables: default_concurrency(),
            table_timeout_ms: None,
            delete_batch_size: default_batch_size(),
            sweep_scope: SweepScope::default(),
            tables: TableRegistry::new(),
        }
    }
}

impl ReconcileConfig {
    /// Load and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        // Check version before strict parsing so the error is actionable
        let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
        let version = raw
            .get("version")
            .and_then(serde_yaml::Value::as_u64)
            .ok_or(ConfigError::MissingVersion)?;
        let supported = u32::try_from(version)
            .map(|v| SUPPORTED_VERSIONS.contains(&v))
            .unwrap_or(false);
        if !supported {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let config: Self = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: u64::from(self.version),
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        validate_identifier(&self.index_table)?;
        validate_identifier(&self.id_column)?;
        self.tables.validate()?;

        if self.max_concurrent_tables == 0 {
            return Err(ConfigError::Validation {
                field: "max_concurrent_tables".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=MAX_DELETE_BATCH_SIZE).contains(&self.delete_batch_size) {
            return Err(ConfigError::Validation {
                field: "delete_batch_size".to_string(),
                reason: format!("{} not in 1..={}", self.delete_batch_size, MAX_DELETE_BATCH_SIZE),
            });
        }
        if self.table_timeout_ms == Some(0) {
            return Err(ConfigError::Validation {
                field: "table_timeout_ms".to_string(),
                reason: "must be greater than 0 when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn layout(&self) -> ConfigResult<IndexLayout> {
        Ok(IndexLayout::new(&self.index_table, &self.id_column)?)
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_concurrent_tables: self.max_concurrent_tables,
            table_timeout: self.table_timeout_ms.map(Duration::from_millis),
            delete_batch_size: self.delete_batch_size,
            sweep_scope: self.sweep_scope,
        }
    }
}
