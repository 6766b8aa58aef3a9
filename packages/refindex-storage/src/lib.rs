//! Reference index storage
//!
//! The reference index records every "record A points to record B"
//! relationship extracted from a set of source tables. This crate owns the
//! domain types and the three ports the reconciler is written against:
//!
//! 1. **TableCatalog**: which tables are eligible (sorted, may be empty)
//! 2. **RecordIndexBuilder**: replace one record's rows (idempotent)
//! 3. **ReferenceIndexStore**: live ids, stale ids, per-record delete, sweep
//!
//! ## Usage
//!
//! ```rust,ignore
//! use refindex_storage::{IndexLayout, SqliteReferenceIndex, TableRegistry};
//!
//! let store = SqliteReferenceIndex::open("site.db", IndexLayout::default())?;
//! let builder = store.record_builder(&registry);
//!
//! let stale = store.stale_record_ids(&table).await?;
//! store.delete_record_rows(&table, &stale.into_iter().collect::<Vec<_>>()).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    IndexRow, RecordId, RecordIndexBuilder, ReferenceField, ReferenceIndexStore, TableCatalog,
    TableDefinition, TableName,
};
pub use infrastructure::{InMemoryReferenceIndex, TableRegistry};

#[cfg(feature = "sqlite")]
pub use infrastructure::{IndexLayout, SqliteRecordIndexBuilder, SqliteReferenceIndex};
