//! In-Memory reference index (for testing)
//!
//! Holds source tables, per-record reference payloads and index rows in
//! maps. Implements both `ReferenceIndexStore` and `RecordIndexBuilder`, and
//! can be told to fail specific reads, rebuilds or deletes.
//! NOT for production use.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::domain::{
    IndexRow, RecordId, RecordIndexBuilder, ReferenceField, ReferenceIndexStore, TableName,
};
use crate::{Result, StorageError};

/// What a record points to: `(field, target table, target id)`
pub type Reference = (ReferenceField, RecordId);

#[derive(Default)]
struct State {
    /// Live records per source table, with the references each one holds
    tables: BTreeMap<TableName, BTreeMap<RecordId, Vec<Reference>>>,
    rows: Vec<IndexRow>,
    rebuild_log: Vec<(TableName, RecordId)>,
    failing_reads: BTreeSet<TableName>,
    failing_deletes: BTreeSet<TableName>,
    failing_rebuilds: BTreeSet<(TableName, RecordId)>,
    failing_sweep: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryReferenceIndex {
    state: Arc<RwLock<State>>,
}

impl InMemoryReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source table (empty if `ids` is empty)
    pub fn create_table(&self, table: TableName, ids: impl IntoIterator<Item = RecordId>) {
        let records = ids.into_iter().map(|id| (id, Vec::new())).collect();
        self.state.write().tables.insert(table, records);
    }

    pub fn drop_table(&self, table: &TableName) {
        self.state.write().tables.remove(table);
    }

    /// Insert or replace a live record and the references it holds
    pub fn put_record(&self, table: &TableName, id: RecordId, references: Vec<Reference>) {
        self.state
            .write()
            .tables
            .entry(table.clone())
            .or_default()
            .insert(id, references);
    }

    pub fn delete_record(&self, table: &TableName, id: RecordId) {
        if let Some(records) = self.state.write().tables.get_mut(table) {
            records.remove(&id);
        }
    }

    /// Write an index row directly, bypassing the builder
    pub fn insert_row(&self, row: IndexRow) {
        self.state.write().rows.push(row);
    }

    /// Current index rows in key order
    pub fn rows(&self) -> Vec<IndexRow> {
        let mut rows = self.state.read().rows.clone();
        rows.sort();
        rows
    }

    /// Every `(table, id)` passed to `rebuild`, in call order
    pub fn rebuild_log(&self) -> Vec<(TableName, RecordId)> {
        self.state.read().rebuild_log.clone()
    }

    pub fn fail_reads_for(&self, table: TableName) {
        self.state.write().failing_reads.insert(table);
    }

    pub fn fail_deletes_for(&self, table: TableName) {
        self.state.write().failing_deletes.insert(table);
    }

    pub fn fail_rebuild_for(&self, table: TableName, id: RecordId) {
        self.state.write().failing_rebuilds.insert((table, id));
    }

    pub fn fail_sweep(&self) {
        self.state.write().failing_sweep = true;
    }
}

#[async_trait]
impl ReferenceIndexStore for InMemoryReferenceIndex {
    async fn live_record_ids(&self, table: &TableName) -> Result<Vec<RecordId>> {
        let state = self.state.read();
        if state.failing_reads.contains(table) {
            return Err(StorageError::database(format!("cannot read table {}", table)));
        }
        Ok(state
            .tables
            .get(table)
            .map(|records| records.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn stale_record_ids(&self, table: &TableName) -> Result<BTreeSet<RecordId>> {
        let state = self.state.read();
        if state.failing_reads.contains(table) {
            return Err(StorageError::database(format!("cannot read table {}", table)));
        }
        let live = state.tables.get(table);
        Ok(state
            .rows
            .iter()
            .filter(|row| &row.source_table == table)
            .map(|row| row.record_id)
            .filter(|id| live.map_or(true, |records| !records.contains_key(id)))
            .collect())
    }

    async fn delete_record_rows(&self, table: &TableName, record_ids: &[RecordId]) -> Result<u64> {
        let mut state = self.state.write();
        if state.failing_deletes.contains(table) {
            return Err(StorageError::database(format!(
                "cannot delete index rows of {}",
                table
            )));
        }
        let before = state.rows.len();
        state
            .rows
            .retain(|row| !(&row.source_table == table && record_ids.contains(&row.record_id)));
        Ok((before - state.rows.len()) as u64)
    }

    async fn delete_rows_outside(&self, keep: &[TableName]) -> Result<u64> {
        let mut state = self.state.write();
        if state.failing_sweep {
            return Err(StorageError::database("sweep rejected"));
        }
        let before = state.rows.len();
        state.rows.retain(|row| keep.contains(&row.source_table));
        Ok((before - state.rows.len()) as u64)
    }

    async fn indexed_tables(&self) -> Result<Vec<TableName>> {
        let state = self.state.read();
        let tables: BTreeSet<TableName> =
            state.rows.iter().map(|row| row.source_table.clone()).collect();
        Ok(tables.into_iter().collect())
    }
}

#[async_trait]
impl RecordIndexBuilder for InMemoryReferenceIndex {
    async fn rebuild(&self, table: &TableName, record_id: RecordId) -> Result<()> {
        let mut state = self.state.write();
        state.rebuild_log.push((table.clone(), record_id));

        if state.failing_rebuilds.contains(&(table.clone(), record_id)) {
            return Err(StorageError::database(format!(
                "cannot rebuild {}:{}",
                table, record_id
            )));
        }

        let fresh: Vec<IndexRow> = state
            .tables
            .get(table)
            .and_then(|records| records.get(&record_id))
            .map(|references| {
                references
                    .iter()
                    .enumerate()
                    .map(|(sorting, (reference, ref_id))| {
                        IndexRow::new(
                            table.clone(),
                            record_id,
                            reference.field.clone(),
                            reference.target.clone(),
                            *ref_id,
                        )
                        .with_sorting(sorting as u32)
                    })
                    .collect()
            })
            .unwrap_or_default();

        state
            .rows
            .retain(|row| !(&row.source_table == table && row.record_id == record_id));
        state.rows.extend(fresh);
        Ok(())
    }
}
