use refindex_storage::{RecordId, StorageError, TableName};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The eligible-table list could not be obtained; fatal to the run
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(#[source] StorageError),

    #[error("Table {table} unreadable: {source}")]
    TableUnreadable {
        table: TableName,
        #[source]
        source: StorageError,
    },

    #[error("Rebuild failed for {table}:{record_id}: {source}")]
    BuildFailure {
        table: TableName,
        record_id: RecordId,
        #[source]
        source: StorageError,
    },

    /// Delete of stale rows (scope = table) or the final sweep (scope = "sweep")
    #[error("Index write failed ({scope}): {source}")]
    StorageWriteFailure {
        scope: String,
        #[source]
        source: StorageError,
    },

    #[error("Timeout: table {table} exceeded {timeout_ms}ms")]
    Timeout { table: TableName, timeout_ms: u64 },
}

impl ReconcileError {
    pub fn table_unreadable(table: &TableName, source: StorageError) -> Self {
        Self::TableUnreadable {
            table: table.clone(),
            source,
        }
    }

    pub fn write_failure(scope: impl Into<String>, source: StorageError) -> Self {
        Self::StorageWriteFailure {
            scope: scope.into(),
            source,
        }
    }

    /// Table the error is attributed to, if any
    pub fn table(&self) -> Option<&TableName> {
        match self {
            ReconcileError::TableUnreadable { table, .. }
            | ReconcileError::BuildFailure { table, .. }
            | ReconcileError::Timeout { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ReconcileError::CatalogUnavailable(_) => ErrorCategory::Infrastructure,
            ReconcileError::TableUnreadable { source, .. }
            | ReconcileError::BuildFailure { source, .. } => {
                if source.is_transient() {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
            ReconcileError::StorageWriteFailure { .. } | ReconcileError::Timeout { .. } => {
                ErrorCategory::Transient
            }
        }
    }
}

/// Error category reported to operators
///
/// No retries happen inside a run; rerunning is the recovery mechanism, and
/// the category says whether a rerun is expected to help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - a rerun is likely to succeed (e.g., lock, timeout)
    Transient,
    /// Permanent error - needs a data or config fix (e.g., missing column)
    Permanent,
    /// Infrastructure error - alert ops (e.g., catalog unreachable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
