//! Error types for refindex-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Identifier rejected before reaching SQL
    InvalidTableName,
    /// Registry/configuration errors
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::InvalidTableName => "invalid_table_name",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn invalid_table_name(name: impl Into<String>, reason: &str) -> Self {
        Self::new(
            ErrorKind::InvalidTableName,
            format!("Invalid table name '{}': {}", name.into(), reason),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Database | ErrorKind::IO)
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
