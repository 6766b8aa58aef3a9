use refindex_storage::{RecordIndexBuilder, ReferenceIndexStore, TableName};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, Result};
use crate::stale::StaleRecordFinder;

/// Outcome of reconciling one table
#[derive(Debug)]
pub struct TableReport {
    pub table: TableName,
    pub live_records: usize,
    pub rebuilt: usize,
    /// Records whose rebuild failed; the table was still reconciled
    pub build_failures: Vec<ReconcileError>,
    pub stale_removed: usize,
    pub rows_deleted: u64,
    pub duration_ms: u64,
}

impl TableReport {
    fn new(table: TableName) -> Self {
        Self {
            table,
            live_records: 0,
            rebuilt: 0,
            build_failures: Vec::new(),
            stale_removed: 0,
            rows_deleted: 0,
            duration_ms: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.build_failures.is_empty()
    }
}

/// Brings the index for a single table in line with its live records
///
/// Every live record is rebuilt first. Stale detection runs only once the
/// whole rebuild loop finished, so a record is never judged stale while its
/// fresh rows are still being written.
pub struct TableReconciler {
    store: Arc<dyn ReferenceIndexStore>,
    builder: Arc<dyn RecordIndexBuilder>,
    finder: StaleRecordFinder,
}

impl TableReconciler {
    pub fn new(
        store: Arc<dyn ReferenceIndexStore>,
        builder: Arc<dyn RecordIndexBuilder>,
        delete_batch_size: usize,
    ) -> Self {
        let finder = StaleRecordFinder::with_batch_size(store.clone(), delete_batch_size);
        Self {
            store,
            builder,
            finder,
        }
    }

    /// Reconcile `table`
    ///
    /// `Err` means the table was skipped or only partially reconciled
    /// (unreadable, or stale rows could not be deleted). Per-record rebuild
    /// failures do not abort and end up in [`TableReport::build_failures`].
    #[tracing::instrument(name = "reconcile_table", skip_all, fields(table = %table))]
    pub async fn reconcile(&self, table: &TableName) -> Result<TableReport> {
        let start = Instant::now();
        let mut report = TableReport::new(table.clone());

        let live = self
            .store
            .live_record_ids(table)
            .await
            .map_err(|e| ReconcileError::table_unreadable(table, e))?;
        report.live_records = live.len();

        for record_id in live {
            match self.builder.rebuild(table, record_id).await {
                Ok(()) => {
                    debug!("Rebuilt {}:{}", table, record_id);
                    report.rebuilt += 1;
                }
                Err(source) => {
                    warn!("Rebuild failed for {}:{}: {}", table, record_id, source);
                    report.build_failures.push(ReconcileError::BuildFailure {
                        table: table.clone(),
                        record_id,
                        source,
                    });
                }
            }
        }

        let stale = self
            .finder
            .find_stale(table)
            .await
            .map_err(|e| ReconcileError::table_unreadable(table, e))?;
        report.stale_removed = stale.len();

        report.rows_deleted = self
            .finder
            .purge(table, &stale)
            .await
            .map_err(|e| ReconcileError::write_failure(table.as_str(), e))?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Table {} reconciled - {} live, {} rebuilt, {} failed, {} stale records ({} rows) removed in {}ms",
            table,
            report.live_records,
            report.rebuilt,
            report.build_failures.len(),
            report.stale_removed,
            report.rows_deleted,
            report.duration_ms
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refindex_storage::{InMemoryReferenceIndex, IndexRow, RecordId, ReferenceField};

    fn t(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    fn pid(target: RecordId) -> (ReferenceField, RecordId) {
        (ReferenceField::new("pid", "pages"), target)
    }

    fn reconciler(store: &InMemoryReferenceIndex) -> TableReconciler {
        let store = Arc::new(store.clone());
        TableReconciler::new(store.clone(), store, 500)
    }

    #[tokio::test]
    async fn test_rebuilds_live_and_removes_stale() {
        let store = InMemoryReferenceIndex::new();
        let table = t("tt_content");
        store.put_record(&table, 10, vec![pid(1)]);
        store.put_record(&table, 20, vec![pid(2), pid(3)]);
        store.insert_row(IndexRow::new(table.clone(), 99, "pid", "pages", 1));
        store.insert_row(IndexRow::new(table.clone(), 99, "pid", "pages", 2));

        let report = reconciler(&store).reconcile(&table).await.unwrap();

        assert_eq!(report.live_records, 2);
        assert_eq!(report.rebuilt, 2);
        assert_eq!(report.stale_removed, 1);
        assert_eq!(report.rows_deleted, 2);
        assert!(report.is_clean());

        let ids: Vec<RecordId> = store.rows().iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![10, 20, 20]);
    }

    #[tokio::test]
    async fn test_rebuild_in_ascending_order() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("pages"), [30, 10, 20]);

        reconciler(&store).reconcile(&t("pages")).await.unwrap();

        let order: Vec<RecordId> = store.rebuild_log().into_iter().map(|(_, id)| id).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_empty_table_purges_everything() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("pages"), []);
        store.insert_row(IndexRow::new(t("pages"), 1, "pid", "pages", 1));
        store.insert_row(IndexRow::new(t("pages"), 2, "pid", "pages", 1));

        let report = reconciler(&store).reconcile(&t("pages")).await.unwrap();

        assert_eq!(report.rebuilt, 0);
        assert_eq!(report.stale_removed, 2);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_record_and_dropped_table_go_stale() {
        let store = InMemoryReferenceIndex::new();
        let table = t("tt_content");
        store.put_record(&table, 1, vec![pid(5)]);
        store.put_record(&table, 2, vec![pid(6)]);
        let reconciler = reconciler(&store);
        reconciler.reconcile(&table).await.unwrap();
        assert_eq!(store.rows().len(), 2);

        store.delete_record(&table, 2);
        let report = reconciler.reconcile(&table).await.unwrap();
        assert_eq!(report.stale_removed, 1);
        let ids: Vec<RecordId> = store.rows().iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![1]);

        store.drop_table(&table);
        let report = reconciler.reconcile(&table).await.unwrap();
        assert_eq!(report.live_records, 0);
        assert_eq!(report.stale_removed, 1);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_does_not_stop_table() {
        let store = InMemoryReferenceIndex::new();
        let table = t("tt_content");
        store.put_record(&table, 1, vec![pid(5)]);
        store.put_record(&table, 2, vec![pid(6)]);
        store.fail_rebuild_for(table.clone(), 1);
        store.insert_row(IndexRow::new(table.clone(), 7, "pid", "pages", 1));

        let report = reconciler(&store).reconcile(&table).await.unwrap();

        assert_eq!(report.rebuilt, 1);
        assert_eq!(report.build_failures.len(), 1);
        assert!(matches!(
            report.build_failures[0],
            ReconcileError::BuildFailure { record_id: 1, .. }
        ));
        // still purged afterwards
        assert_eq!(report.stale_removed, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_unreadable_table_is_skipped() {
        let store = InMemoryReferenceIndex::new();
        store.create_table(t("pages"), [1]);
        store.fail_reads_for(t("pages"));

        let err = reconciler(&store).reconcile(&t("pages")).await.unwrap_err();

        assert!(matches!(err, ReconcileError::TableUnreadable { .. }));
        assert!(store.rebuild_log().is_empty());
    }

    #[tokio::test]
    async fn test_purge_failure_keeps_rebuilt_rows() {
        let store = InMemoryReferenceIndex::new();
        let table = t("tt_content");
        store.put_record(&table, 1, vec![pid(5)]);
        store.insert_row(IndexRow::new(table.clone(), 9, "pid", "pages", 1));
        store.fail_deletes_for(table.clone());

        let err = reconciler(&store).reconcile(&table).await.unwrap_err();

        assert!(
            matches!(err, ReconcileError::StorageWriteFailure { ref scope, .. } if scope == "tt_content")
        );
        let ids: Vec<RecordId> = store.rows().iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![1, 9]);
    }
}
