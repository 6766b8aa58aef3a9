//! Storage Ports (Trait Interfaces)
//!
//! Port/Adapter pattern for backend flexibility:
//! - SQLite: `SqliteReferenceIndex` + `SqliteRecordIndexBuilder`
//! - Testing: `InMemoryReferenceIndex`
//! - Catalog: `TableRegistry` (config-backed)

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{RecordId, TableName};
use crate::Result;

/// Table-definition registry
///
/// Lists the tables that currently take part in indexing.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Eligible tables, sorted ascending
    ///
    /// An empty list is a valid answer. An error means the catalog itself
    /// could not be read.
    async fn list_eligible_tables(&self) -> Result<Vec<TableName>>;
}

/// Per-record index builder
#[async_trait]
pub trait RecordIndexBuilder: Send + Sync {
    /// Replace every index row of `(table, record_id)` with freshly computed ones
    ///
    /// Zero rows is a valid outcome. Calling twice with no data change in
    /// between leaves the index unchanged.
    async fn rebuild(&self, table: &TableName, record_id: RecordId) -> Result<()>;
}

/// Query surface over the index table and the source tables it is derived from
#[async_trait]
pub trait ReferenceIndexStore: Send + Sync {
    /// Identifiers of every record currently stored in `table`, ascending
    ///
    /// A table absent from storage yields an empty list.
    async fn live_record_ids(&self, table: &TableName) -> Result<Vec<RecordId>>;

    /// Record ids with index rows for `table` that no longer exist in `table`
    ///
    /// Computed as a single set-difference query. A missing or empty table
    /// makes all of its index rows stale.
    async fn stale_record_ids(&self, table: &TableName) -> Result<BTreeSet<RecordId>>;

    /// Delete all index rows of `table` for the given records
    ///
    /// Returns the number of index rows removed.
    async fn delete_record_rows(&self, table: &TableName, record_ids: &[RecordId]) -> Result<u64>;

    /// Delete every index row whose source table is not in `keep`
    ///
    /// One set-based statement. Returns the number of index rows removed.
    async fn delete_rows_outside(&self, keep: &[TableName]) -> Result<u64>;

    /// Distinct source tables that currently own index rows, ascending
    async fn indexed_tables(&self) -> Result<Vec<TableName>>;
}
