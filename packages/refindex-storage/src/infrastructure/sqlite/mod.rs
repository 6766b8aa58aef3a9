//! SQLite reference index
//!
//! Index rows live in one table (default `sys_refindex`) next to the source
//! tables they are derived from, so stale detection and the sweep are plain
//! set-membership queries (`NOT IN`) executed by SQLite.

mod builder;

pub use builder::{extract_references, FieldValue, SqliteRecordIndexBuilder};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{
    quote_identifier, validate_identifier, IndexRow, RecordId, ReferenceIndexStore, TableName,
};
use crate::infrastructure::TableRegistry;
use crate::{Result, StorageError};

pub const DEFAULT_INDEX_TABLE: &str = "sys_refindex";
pub const DEFAULT_ID_COLUMN: &str = "uid";

/// Names of the index table and of the id column shared by source tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    index_table: String,
    id_column: String,
}

impl IndexLayout {
    pub fn new(index_table: impl Into<String>, id_column: impl Into<String>) -> Result<Self> {
        let index_table = index_table.into();
        let id_column = id_column.into();
        validate_identifier(&index_table)?;
        validate_identifier(&id_column)?;
        Ok(Self {
            index_table,
            id_column,
        })
    }

    pub fn index_table(&self) -> &str {
        &self.index_table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub(crate) fn quoted_index(&self) -> String {
        quote_identifier(&self.index_table)
    }

    pub(crate) fn quoted_id(&self) -> String {
        quote_identifier(&self.id_column)
    }
}

impl Default for IndexLayout {
    fn default() -> Self {
        Self {
            index_table: DEFAULT_INDEX_TABLE.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
        }
    }
}

/// Run `f` on the blocking pool with the connection locked
///
/// The returned future stays pending while the statements run.
pub(crate) async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| StorageError::database(format!("blocking task failed: {}", e)))?
}

/// Whether `name` exists as a table or view in the connected database.
///
/// Matched case-insensitively, like SQLite resolves identifiers.
pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Fail unless `table` has every column in `columns` (case-insensitive).
///
/// SQLite resolves a double-quoted name that matches no column to a string
/// literal, so a missing column must be caught before building queries.
pub(crate) fn require_columns(conn: &Connection, table: &TableName, columns: &[&str]) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let present = stmt
        .query_map(params![table.as_str()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    match columns
        .iter()
        .find(|column| !present.iter().any(|name| name.eq_ignore_ascii_case(column)))
    {
        Some(missing) => Err(StorageError::config(format!(
            "table {} has no column {}",
            table, missing
        ))),
        None => Ok(()),
    }
}

/// SQLite-based ReferenceIndexStore implementation
#[derive(Clone)]
pub struct SqliteReferenceIndex {
    conn: Arc<Mutex<Connection>>,
    layout: IndexLayout,
}

impl SqliteReferenceIndex {
    /// Open (or create) the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, layout: IndexLayout) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        Self::from_connection(conn, layout)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory(layout: IndexLayout) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, layout)
    }

    pub fn from_connection(conn: Connection, layout: IndexLayout) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            layout,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    /// Record builder writing into this index through the same connection
    pub fn record_builder(&self, registry: &TableRegistry) -> SqliteRecordIndexBuilder {
        SqliteRecordIndexBuilder::new(self.conn.clone(), self.layout.clone(), registry)
    }

    /// Run `f` against the underlying connection
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&*conn)?)
    }

    /// Initialize the index table schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let index = self.layout.quoted_index();
        let source_idx = quote_identifier(&format!("idx_{}_source", self.layout.index_table));

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {index} (
                id         INTEGER PRIMARY KEY,
                tablename  TEXT    NOT NULL,
                recuid     INTEGER NOT NULL,
                field      TEXT    NOT NULL,
                ref_table  TEXT    NOT NULL,
                ref_uid    INTEGER NOT NULL,
                sorting    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS {source_idx} ON {index}(tablename, recuid);"
        ))?;

        Ok(())
    }

    /// Index rows, optionally restricted to one source table
    ///
    /// Ordered by `(tablename, recuid, field, sorting)`.
    pub fn index_rows(&self, table: Option<&TableName>) -> Result<Vec<IndexRow>> {
        let conn = self.conn.lock();
        let index = self.layout.quoted_index();
        let mut sql = format!(
            "SELECT tablename, recuid, field, ref_table, ref_uid, sorting FROM {index}"
        );
        let mut args: Vec<Value> = Vec::new();
        if let Some(table) = table {
            sql.push_str(" WHERE tablename = ?1");
            args.push(Value::Text(table.as_str().to_string()));
        }
        sql.push_str(" ORDER BY tablename, recuid, field, sorting, ref_table, ref_uid");

        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(source, record_id, field, ref_table, ref_id, sorting)| -> Result<IndexRow> {
                Ok(IndexRow::new(TableName::new(source)?, record_id, field, ref_table, ref_id)
                    .with_sorting(sorting))
            })
            .collect()
    }

    /// Total number of index rows
    pub fn count_rows(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.layout.quoted_index()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ReferenceIndexStore for SqliteReferenceIndex {
    async fn live_record_ids(&self, table: &TableName) -> Result<Vec<RecordId>> {
        let table = table.clone();
        let layout = self.layout.clone();
        run_blocking(&self.conn, move |conn| {
            if !table_exists(conn, table.as_str())? {
                debug!("Table {} not present in storage, treating as empty", table);
                return Ok(Vec::new());
            }
            require_columns(conn, &table, &[layout.id_column()])?;

            let id = layout.quoted_id();
            let mut stmt = conn.prepare(&format!(
                "SELECT {id} FROM {} WHERE {id} IS NOT NULL ORDER BY {id}",
                table.quoted()
            ))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn stale_record_ids(&self, table: &TableName) -> Result<BTreeSet<RecordId>> {
        let table = table.clone();
        let layout = self.layout.clone();
        run_blocking(&self.conn, move |conn| {
            let index = layout.quoted_index();

            let sql = if table_exists(conn, table.as_str())? {
                require_columns(conn, &table, &[layout.id_column()])?;
                let id = layout.quoted_id();
                format!(
                    "SELECT recuid FROM {index}
                     WHERE tablename = ?1
                       AND recuid NOT IN (SELECT {id} FROM {} WHERE {id} IS NOT NULL)
                     GROUP BY recuid",
                    table.quoted()
                )
            } else {
                format!("SELECT recuid FROM {index} WHERE tablename = ?1 GROUP BY recuid")
            };

            let mut stmt = conn.prepare(&sql)?;
            let stale = stmt
                .query_map(params![table.as_str()], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(stale)
        })
        .await
    }

    async fn delete_record_rows(&self, table: &TableName, record_ids: &[RecordId]) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = (2..record_ids.len() + 2)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "DELETE FROM {} WHERE tablename = ?1 AND recuid IN ({})",
            self.layout.quoted_index(),
            placeholders
        );
        let args: Vec<Value> = std::iter::once(Value::Text(table.as_str().to_string()))
            .chain(record_ids.iter().map(|id| Value::Integer(*id)))
            .collect();

        run_blocking(&self.conn, move |conn| {
            let deleted = conn.execute(&sql, params_from_iter(args))?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn delete_rows_outside(&self, keep: &[TableName]) -> Result<u64> {
        let index = self.layout.quoted_index();
        let keep: Vec<String> = keep.iter().map(|table| table.as_str().to_string()).collect();

        run_blocking(&self.conn, move |conn| {
            let deleted = if keep.is_empty() {
                conn.execute(&format!("DELETE FROM {index}"), [])?
            } else {
                let placeholders = (1..=keep.len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ");
                conn.execute(
                    &format!("DELETE FROM {index} WHERE tablename NOT IN ({placeholders})"),
                    params_from_iter(keep.iter()),
                )?
            };
            Ok(deleted as u64)
        })
        .await
    }

    async fn indexed_tables(&self) -> Result<Vec<TableName>> {
        let sql = format!(
            "SELECT DISTINCT tablename FROM {} ORDER BY tablename",
            self.layout.quoted_index()
        );
        let names = run_blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await?;

        Ok(names
            .into_iter()
            .filter_map(|name| match TableName::new(name.clone()) {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!("Skipping index rows with unusable table name {:?}: {}", name, e);
                    None
                }
            })
            .collect())
    }
}
