//! Stale index row detection
//!
//! A record id is stale for table T when the index still has rows for
//! `(T, id)` but T no longer contains the record. The set is computed by the
//! store in one set-difference query; the purge then deletes those rows in
//! bounded `IN (...)` batches.

use refindex_storage::{RecordId, ReferenceIndexStore, TableName};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::config::DEFAULT_DELETE_BATCH_SIZE;

pub struct StaleRecordFinder {
    store: Arc<dyn ReferenceIndexStore>,
    batch_size: usize,
}

impl StaleRecordFinder {
    pub fn new(store: Arc<dyn ReferenceIndexStore>) -> Self {
        Self::with_batch_size(store, DEFAULT_DELETE_BATCH_SIZE)
    }

    pub fn with_batch_size(store: Arc<dyn ReferenceIndexStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Record ids indexed for `table` that are no longer present in it
    pub async fn find_stale(&self, table: &TableName) -> refindex_storage::Result<BTreeSet<RecordId>> {
        let stale = self.store.stale_record_ids(table).await?;
        debug!("Table {}: {} stale record ids", table, stale.len());
        Ok(stale)
    }

    /// Delete all index rows of `table` for `record_ids`
    ///
    /// Returns the number of index rows removed. Batches already deleted stay
    /// deleted if a later batch fails.
    pub async fn purge(
        &self,
        table: &TableName,
        record_ids: &BTreeSet<RecordId>,
    ) -> refindex_storage::Result<u64> {
        let ids: Vec<RecordId> = record_ids.iter().copied().collect();
        let mut deleted = 0;

        for batch in ids.chunks(self.batch_size) {
            deleted += self.store.delete_record_rows(table, batch).await?;
        }

        if deleted > 0 {
            debug!(
                "Table {}: purged {} index rows for {} stale records",
                table,
                deleted,
                ids.len()
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refindex_storage::{InMemoryReferenceIndex, IndexRow, StorageError};
    use std::sync::Mutex;

    fn t(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    fn row(table: &str, id: RecordId) -> IndexRow {
        IndexRow::new(t(table), id, "pid", "pages", 1)
    }

    /// Records the size of every delete batch
    struct BatchRecorder {
        inner: InMemoryReferenceIndex,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ReferenceIndexStore for BatchRecorder {
        async fn live_record_ids(&self, table: &TableName) -> refindex_storage::Result<Vec<RecordId>> {
            self.inner.live_record_ids(table).await
        }

        async fn stale_record_ids(
            &self,
            table: &TableName,
        ) -> refindex_storage::Result<BTreeSet<RecordId>> {
            self.inner.stale_record_ids(table).await
        }

        async fn delete_record_rows(
            &self,
            table: &TableName,
            record_ids: &[RecordId],
        ) -> refindex_storage::Result<u64> {
            self.batches.lock().unwrap().push(record_ids.len());
            self.inner.delete_record_rows(table, record_ids).await
        }

        async fn delete_rows_outside(&self, keep: &[TableName]) -> refindex_storage::Result<u64> {
            self.inner.delete_rows_outside(keep).await
        }

        async fn indexed_tables(&self) -> refindex_storage::Result<Vec<TableName>> {
            self.inner.indexed_tables().await
        }
    }

    #[tokio::test]
    async fn test_find_stale_returns_deleted_records() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("table_1"), [10, 20]);
        store.insert_row(row("table_1", 10));
        store.insert_row(row("table_1", 99));

        let finder = StaleRecordFinder::new(Arc::new(store));
        let stale = finder.find_stale(&t("table_1")).await.unwrap();
        assert_eq!(stale, BTreeSet::from([99]));
    }

    #[tokio::test]
    async fn test_find_stale_nothing_stale() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("table_1"), [10]);
        store.insert_row(row("table_1", 10));

        let finder = StaleRecordFinder::new(Arc::new(store));
        assert!(finder.find_stale(&t("table_1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_stale_empty_table_all_stale() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("pages"), []);
        store.insert_row(row("pages", 1));
        store.insert_row(row("pages", 2));

        let finder = StaleRecordFinder::new(Arc::new(store));
        assert_eq!(
            finder.find_stale(&t("pages")).await.unwrap(),
            BTreeSet::from([1, 2])
        );
    }

    #[tokio::test]
    async fn test_purge_in_batches() {
        let inner = InMemoryReferenceIndex::new();
        for id in 1..=7 {
            inner.insert_row(row("pages", id));
        }
        inner.insert_row(row("tt_content", 1));

        let recorder = Arc::new(BatchRecorder {
            inner: inner.clone(),
            batches: Mutex::new(Vec::new()),
        });
        let finder = StaleRecordFinder::with_batch_size(recorder.clone(), 3);

        let ids: BTreeSet<RecordId> = (1..=7).collect();
        let deleted = finder.purge(&t("pages"), &ids).await.unwrap();

        assert_eq!(deleted, 7);
        assert_eq!(*recorder.batches.lock().unwrap(), vec![3, 3, 1]);
        assert_eq!(inner.rows(), vec![row("tt_content", 1)]);
    }

    #[tokio::test]
    async fn test_purge_empty_set_issues_no_delete() {
        let recorder = Arc::new(BatchRecorder {
            inner: InMemoryReferenceIndex::new(),
            batches: Mutex::new(Vec::new()),
        });
        let finder = StaleRecordFinder::new(recorder.clone());

        assert_eq!(finder.purge(&t("pages"), &BTreeSet::new()).await.unwrap(), 0);
        assert!(recorder.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_propagates_write_failure() {
        let store = InMemoryReferenceIndex::new();
        store.insert_row(row("pages", 1));
        store.fail_deletes_for(t("pages"));

        let finder = StaleRecordFinder::new(Arc::new(store));
        let err: StorageError = finder
            .purge(&t("pages"), &BTreeSet::from([1]))
            .await
            .unwrap_err();
        assert!(err.message.contains("cannot delete"));
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let finder = StaleRecordFinder::with_batch_size(Arc::new(InMemoryReferenceIndex::new()), 0);
        assert_eq!(finder.batch_size(), 1);
    }
}
