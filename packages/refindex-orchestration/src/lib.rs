/*
 * Reference Index Reconciliation
 *
 * Brings a persisted reference index back in line with its source tables.
 *
 * Run:
 * - Working set = eligible tables ∩ selection (catalog order)
 * - Per table: rebuild every live record, then purge stale records
 * - Sweep: drop rows of tables outside the working set, once
 *
 * Runs are idempotent; rerunning is the recovery path after any failure.
 */

pub mod config;
pub mod error;
pub mod run;
pub mod stale;
pub mod table;
pub mod task;

// Re-exports
pub use config::{ConfigError, ReconcileConfig, RunOptions, SweepScope};
pub use error::{ErrorCategory, ReconcileError, Result};
pub use run::{ErrorSummary, IndexReconciliationRun, RunResult, RunSummary, TableSummary, WorkingSet};
pub use stale::StaleRecordFinder;
pub use table::{TableReconciler, TableReport};
pub use task::{ReferenceIndexUpdater, UpdateRefIndexTask};
