//! One reconciliation pass over the reference index
//!
//! 1. Resolve the working set (eligible tables, narrowed by the selection)
//! 2. Reconcile each table in catalog order
//! 3. Sweep rows of tables outside the kept set, once, after all tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use refindex_storage::{RecordIndexBuilder, ReferenceIndexStore, TableCatalog, TableName};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{RunOptions, SweepScope};
use crate::error::{ErrorCategory, ReconcileError, Result};
use crate::table::{TableReconciler, TableReport};
use crate::task::ReferenceIndexUpdater;

/// Tables a run operates on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    /// Tables to reconcile, in catalog order
    pub tables: Vec<TableName>,
    /// Full eligible list as reported by the catalog
    pub eligible: Vec<TableName>,
    /// Selected names that are not eligible
    pub ignored: Vec<TableName>,
}

impl WorkingSet {
    /// Intersect `eligible` with `selection`
    ///
    /// `None` or an empty selection means every eligible table. Duplicates
    /// are dropped from both inputs.
    pub fn resolve(eligible: Vec<TableName>, selection: Option<&[TableName]>) -> Self {
        let mut seen = BTreeSet::new();
        let eligible: Vec<TableName> = eligible
            .into_iter()
            .filter(|table| seen.insert(table.clone()))
            .collect();

        let selection = match selection {
            Some(selected) if !selected.is_empty() => selected,
            _ => {
                return Self {
                    tables: eligible.clone(),
                    eligible,
                    ignored: Vec::new(),
                }
            }
        };

        let wanted: BTreeSet<&TableName> = selection.iter().collect();
        let tables = eligible
            .iter()
            .filter(|table| wanted.contains(table))
            .cloned()
            .collect();

        let mut reported = BTreeSet::new();
        let ignored = selection
            .iter()
            .filter(|table| !seen.contains(*table) && reported.insert(*table))
            .cloned()
            .collect();

        Self {
            tables,
            eligible,
            ignored,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Result of one run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub working_set: Vec<TableName>,
    pub ignored_selection: Vec<TableName>,
    /// Tables that completed reconciliation, in catalog order
    pub tables: Vec<TableReport>,
    pub swept_rows: u64,
    /// Tables that were skipped or only partly reconciled, and sweep failures
    pub errors: Vec<ReconcileError>,
}

impl RunResult {
    pub fn processed_tables(&self) -> Vec<&TableName> {
        self.tables.iter().map(|report| &report.table).collect()
    }

    pub fn report(&self, table: &TableName) -> Option<&TableReport> {
        self.tables.iter().find(|report| &report.table == table)
    }

    /// No run-level error and no per-record build failure
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.tables.iter().all(TableReport::is_clean)
    }

    /// Run errors followed by per-record build failures
    pub fn all_errors(&self) -> impl Iterator<Item = &ReconcileError> {
        self.errors
            .iter()
            .chain(self.tables.iter().flat_map(|report| report.build_failures.iter()))
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: (self.finished_at - self.started_at).num_milliseconds().max(0) as u64,
            working_set: self.working_set.clone(),
            ignored_selection: self.ignored_selection.clone(),
            tables: self
                .tables
                .iter()
                .map(|report| TableSummary {
                    table: report.table.clone(),
                    live_records: report.live_records,
                    rebuilt: report.rebuilt,
                    build_failures: report.build_failures.len(),
                    stale_removed: report.stale_removed,
                    rows_deleted: report.rows_deleted,
                    duration_ms: report.duration_ms,
                })
                .collect(),
            swept_rows: self.swept_rows,
            errors: self
                .all_errors()
                .map(|e| ErrorSummary {
                    table: e.table().cloned(),
                    category: e.category(),
                    message: e.to_string(),
                })
                .collect(),
            clean: self.is_clean(),
        }
    }
}

/// Serializable view of a [`RunResult`]
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub working_set: Vec<TableName>,
    pub ignored_selection: Vec<TableName>,
    pub tables: Vec<TableSummary>,
    pub swept_rows: u64,
    pub errors: Vec<ErrorSummary>,
    pub clean: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub table: TableName,
    pub live_records: usize,
    pub rebuilt: usize,
    pub build_failures: usize,
    pub stale_removed: usize,
    pub rows_deleted: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableName>,
    pub category: ErrorCategory,
    pub message: String,
}

/// Reconciliation driver
///
/// Holds no state between runs. Two runs against the same index must not
/// overlap; callers serialize them.
pub struct IndexReconciliationRun {
    catalog: Arc<dyn TableCatalog>,
    store: Arc<dyn ReferenceIndexStore>,
    reconciler: TableReconciler,
    options: RunOptions,
}

impl IndexReconciliationRun {
    pub fn new(
        catalog: Arc<dyn TableCatalog>,
        store: Arc<dyn ReferenceIndexStore>,
        builder: Arc<dyn RecordIndexBuilder>,
        options: RunOptions,
    ) -> Self {
        let reconciler = TableReconciler::new(store.clone(), builder, options.delete_batch_size);
        Self {
            catalog,
            store,
            reconciler,
            options,
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Resolve the working set without touching the index
    pub async fn working_set(&self, selection: Option<&[TableName]>) -> Result<WorkingSet> {
        let eligible = self.catalog.list_eligible_tables().await.map_err(|e| {
            error!("Cannot list eligible tables: {}", e);
            ReconcileError::CatalogUnavailable(e)
        })?;
        Ok(WorkingSet::resolve(eligible, selection))
    }

    /// Run one reconciliation pass
    ///
    /// Only a catalog failure is returned as `Err`. Everything else is
    /// attributed to its table (or to the sweep) in [`RunResult::errors`].
    pub async fn run(&self, selection: Option<&[TableName]>) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", run_id = %run_id);
        self.execute(run_id, selection).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, selection: Option<&[TableName]>) -> Result<RunResult> {
        let started_at = Utc::now();
        let working_set = self.working_set(selection).await?;

        for table in &working_set.ignored {
            warn!("Ignoring selected table {}: not eligible for indexing", table);
        }

        let mut result = RunResult {
            run_id,
            started_at,
            finished_at: started_at,
            working_set: working_set.tables.clone(),
            ignored_selection: working_set.ignored.clone(),
            tables: Vec::new(),
            swept_rows: 0,
            errors: Vec::new(),
        };

        if working_set.is_empty() {
            info!("Nothing to reconcile: working set is empty");
            result.finished_at = Utc::now();
            return Ok(result);
        }

        info!(
            "Reconciling {} of {} eligible tables",
            working_set.tables.len(),
            working_set.eligible.len()
        );

        let outcomes: Vec<Result<TableReport>> = stream::iter(working_set.tables.iter().cloned())
            .map(|table| async move { self.reconcile_within_budget(&table).await })
            .buffered(self.options.max_concurrent_tables.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(report) => result.tables.push(report),
                Err(e) => {
                    warn!("{}", e);
                    result.errors.push(e);
                }
            }
        }

        let keep = match self.options.sweep_scope {
            SweepScope::WorkingSet => &working_set.tables,
            SweepScope::Eligible => &working_set.eligible,
        };
        match self.store.delete_rows_outside(keep).await {
            Ok(swept) => result.swept_rows = swept,
            Err(e) => {
                let e = ReconcileError::write_failure("sweep", e);
                warn!("{}", e);
                result.errors.push(e);
            }
        }

        result.finished_at = Utc::now();
        info!(
            "Run finished - {} tables reconciled, {} failed, {} rows swept, {} errors",
            result.tables.len(),
            working_set.tables.len() - result.tables.len(),
            result.swept_rows,
            result.all_errors().count()
        );
        Ok(result)
    }

    async fn reconcile_within_budget(&self, table: &TableName) -> Result<TableReport> {
        let Some(budget) = self.options.table_timeout else {
            return self.reconciler.reconcile(table).await;
        };

        match tokio::time::timeout(budget, self.reconciler.reconcile(table)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReconcileError::Timeout {
                table: table.clone(),
                timeout_ms: budget.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl ReferenceIndexUpdater for IndexReconciliationRun {
    async fn update(&self, selection: Option<&[TableName]>) -> Result<RunResult> {
        self.run(selection).await
    }
}
