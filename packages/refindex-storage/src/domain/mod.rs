//! Domain layer for the reference index
//!
//! # Domain Models
//!
//! - `TableName`: validated source table identifier
//! - `IndexRow`: one "record A points to record B" entry
//! - `TableDefinition`: reference columns declared for a source table
//!
//! # Port Traits
//!
//! - `TableCatalog`: which tables are eligible for indexing
//! - `RecordIndexBuilder`: replace one record's index rows
//! - `ReferenceIndexStore`: set-based queries against the index and source tables
//!
//! Reconciliation identity is `(source_table, record_id)`. Every row sharing
//! that key is written and deleted as a group.

pub mod ports;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, StorageError};

pub use ports::{RecordIndexBuilder, ReferenceIndexStore, TableCatalog};

/// Source record identifier (SQLite `INTEGER`).
pub type RecordId = i64;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate an SQL identifier used for tables and columns.
///
/// Identifiers end up double-quoted inside SQL text, so only
/// `[A-Za-z_][A-Za-z0-9_]*` up to 64 bytes is accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::invalid_table_name(name, "must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(StorageError::invalid_table_name(
            name,
            &format!("longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }
    if name.as_bytes()[0].is_ascii_digit() {
        return Err(StorageError::invalid_table_name(
            name,
            "must not start with a digit",
        ));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(StorageError::invalid_table_name(
            name,
            &format!("unexpected character '{}'", c),
        ));
    }
    Ok(())
}

/// Quote a validated identifier for interpolation into SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Source table name
///
/// Construction validates the identifier, so a `TableName` can always be
/// quoted into SQL safely. Ordering is plain string ordering, which is the
/// order the catalog reports tables in.
///
/// # Examples
///
/// ```rust
/// use refindex_storage::domain::TableName;
///
/// let table = TableName::new("tt_content").unwrap();
/// assert_eq!(table.as_str(), "tt_content");
/// assert!(TableName::new("tt-content").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQL text
    pub fn quoted(&self) -> String {
        quote_identifier(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TableName {
    type Error = StorageError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reference index entry
///
/// `source_table`/`record_id` identify the referencing record. The remaining
/// fields are payload owned by the `RecordIndexBuilder` that produced the row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexRow {
    pub source_table: TableName,
    pub record_id: RecordId,
    /// Column of the source record holding the reference
    pub field: String,
    /// Table the reference points into
    pub ref_table: String,
    /// Identifier of the referenced record
    pub ref_id: RecordId,
    /// Position within a multi-value field
    #[serde(default)]
    pub sorting: u32,
}

impl IndexRow {
    pub fn new(
        source_table: TableName,
        record_id: RecordId,
        field: impl Into<String>,
        ref_table: impl Into<String>,
        ref_id: RecordId,
    ) -> Self {
        Self {
            source_table,
            record_id,
            field: field.into(),
            ref_table: ref_table.into(),
            ref_id,
            sorting: 0,
        }
    }

    pub fn with_sorting(mut self, sorting: u32) -> Self {
        self.sorting = sorting;
        self
    }

    /// Reconciliation identity of this row
    pub fn key(&self) -> (&TableName, RecordId) {
        (&self.source_table, self.record_id)
    }
}

/// A declared reference column: `field` holds ids of records in `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceField {
    pub field: String,
    pub target: String,
}

impl ReferenceField {
    pub fn new(field: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            target: target.into(),
        }
    }
}

/// Registry entry for an indexable table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDefinition {
    #[serde(default)]
    pub references: Vec<ReferenceField>,
}

impl TableDefinition {
    pub fn with_references(references: Vec<ReferenceField>) -> Self {
        Self { references }
    }

    pub fn validate(&self) -> Result<()> {
        for reference in &self.references {
            validate_identifier(&reference.field)?;
            validate_identifier(&reference.target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_table_name_accepts_identifiers() {
        for name in ["pages", "tt_content", "_hidden", "sys_file_reference", "T1"] {
            assert!(TableName::new(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_table_name_rejects_non_identifiers() {
        for name in ["", "1table", "tt-content", "pages; DROP TABLE x", "tbl\"x", "é"] {
            let err = TableName::new(name).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidTableName, "{:?}", name);
        }

        let long = "a".repeat(65);
        assert!(TableName::new(long).is_err());
        assert!(TableName::new("a".repeat(64)).is_ok());
    }

    #[test]
    fn test_table_name_orders_like_strings() {
        let mut names = vec![
            TableName::new("table_3").unwrap(),
            TableName::new("table_0").unwrap(),
            TableName::new("table_1").unwrap(),
        ];
        names.sort();
        let names: Vec<&str> = names.iter().map(TableName::as_str).collect();
        assert_eq!(names, vec!["table_0", "table_1", "table_3"]);
    }

    #[test]
    fn test_table_name_quoted() {
        assert_eq!(TableName::new("pages").unwrap().quoted(), "\"pages\"");
    }

    #[test]
    fn test_table_name_serde_validates() {
        let table: TableName = serde_json::from_str("\"pages\"").unwrap();
        assert_eq!(table.as_str(), "pages");
        assert_eq!(serde_json::to_string(&table).unwrap(), "\"pages\"");

        assert!(serde_json::from_str::<TableName>("\"no spaces\"").is_err());
    }

    #[test]
    fn test_index_row_key() {
        let table = TableName::new("tt_content").unwrap();
        let row = IndexRow::new(table.clone(), 10, "pid", "pages", 1).with_sorting(2);

        assert_eq!(row.key(), (&table, 10));
        assert_eq!(row.sorting, 2);
    }

    #[test]
    fn test_table_definition_validate() {
        let ok = TableDefinition::with_references(vec![ReferenceField::new("pid", "pages")]);
        assert!(ok.validate().is_ok());

        let bad = TableDefinition::with_references(vec![ReferenceField::new("pid", "pa ges")]);
        assert!(bad.validate().is_err());
    }
}
