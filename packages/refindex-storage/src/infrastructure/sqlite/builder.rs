//! Column-reference record builder
//!
//! A table's registry entry declares which columns hold references
//! (`field` → `target` table). Rebuilding a record reads those columns and
//! writes one index row per referenced id. Integer columns hold a single id;
//! text columns may hold a comma-separated id list. `0` and `NULL` mean
//! "no reference".

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{require_columns, run_blocking, table_exists, IndexLayout};
use crate::domain::{
    quote_identifier, IndexRow, RecordId, RecordIndexBuilder, TableDefinition, TableName,
};
use crate::infrastructure::TableRegistry;
use crate::Result;

/// Raw value of one reference column
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
    Other,
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(n) => FieldValue::Integer(n),
            ValueRef::Text(bytes) => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Real(_) | ValueRef::Blob(_) => FieldValue::Other,
        }
    }
}

/// Compute the index rows of one record from its reference column values
///
/// `values` is aligned with `definition.references`.
pub fn extract_references(
    table: &TableName,
    record_id: RecordId,
    definition: &TableDefinition,
    values: &[FieldValue],
) -> Vec<IndexRow> {
    let mut rows = Vec::new();

    for (reference, value) in definition.references.iter().zip(values) {
        let ids: Vec<RecordId> = match value {
            FieldValue::Integer(0) | FieldValue::Null | FieldValue::Other => continue,
            FieldValue::Integer(id) => vec![*id],
            FieldValue::Text(list) => list
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .filter_map(|part| match part.parse::<RecordId>() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        warn!(
                            "{}:{} field {} holds non-numeric reference {:?}, ignored",
                            table, record_id, reference.field, part
                        );
                        None
                    }
                })
                .filter(|id| *id != 0)
                .collect(),
        };

        for (sorting, ref_id) in ids.into_iter().enumerate() {
            rows.push(
                IndexRow::new(
                    table.clone(),
                    record_id,
                    reference.field.clone(),
                    reference.target.clone(),
                    ref_id,
                )
                .with_sorting(sorting as u32),
            );
        }
    }

    rows
}

/// SQLite-based RecordIndexBuilder implementation
///
/// Shares the connection of the `SqliteReferenceIndex` that created it.
#[derive(Clone)]
pub struct SqliteRecordIndexBuilder {
    conn: Arc<Mutex<Connection>>,
    layout: IndexLayout,
    definitions: Arc<BTreeMap<TableName, TableDefinition>>,
}

impl SqliteRecordIndexBuilder {
    pub(crate) fn new(
        conn: Arc<Mutex<Connection>>,
        layout: IndexLayout,
        registry: &TableRegistry,
    ) -> Self {
        Self {
            conn,
            layout,
            definitions: Arc::new(registry.definitions().clone()),
        }
    }

    fn read_fields(
        &self,
        conn: &Connection,
        table: &TableName,
        record_id: RecordId,
        definition: &TableDefinition,
    ) -> Result<Option<Vec<FieldValue>>> {
        if definition.references.is_empty() || !table_exists(conn, table.as_str())? {
            return Ok(None);
        }
        let mut needed: Vec<&str> = vec![self.layout.id_column()];
        needed.extend(definition.references.iter().map(|r| r.field.as_str()));
        require_columns(conn, table, &needed)?;

        let columns = definition
            .references
            .iter()
            .map(|r| quote_identifier(&r.field))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            columns,
            table.quoted(),
            self.layout.quoted_id()
        );

        let width = definition.references.len();
        let values = conn
            .query_row(&sql, params![record_id], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(FieldValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .optional()?;
        Ok(values)
    }

    /// Replace the index rows of one record inside a single transaction
    fn write_record(
        &self,
        conn: &mut Connection,
        table: &TableName,
        record_id: RecordId,
    ) -> Result<()> {
        let rows = match self.definitions.get(table) {
            Some(definition) => match self.read_fields(conn, table, record_id, definition)? {
                Some(values) => extract_references(table, record_id, definition, &values),
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let index = self.layout.quoted_index();
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM {index} WHERE tablename = ?1 AND recuid = ?2"),
            params![table.as_str(), record_id],
        )?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {index} (tablename, recuid, field, ref_table, ref_uid, sorting)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ))?;
            for row in &rows {
                insert.execute(params![
                    row.source_table.as_str(),
                    row.record_id,
                    row.field,
                    row.ref_table,
                    row.ref_id,
                    row.sorting
                ])?;
            }
        }
        tx.commit()?;

        debug!("Rebuilt {}:{} with {} index rows", table, record_id, rows.len());
        Ok(())
    }
}

#[async_trait]
impl RecordIndexBuilder for SqliteRecordIndexBuilder {
    async fn rebuild(&self, table: &TableName, record_id: RecordId) -> Result<()> {
        let builder = self.clone();
        let table = table.clone();
        run_blocking(&self.conn, move |conn| builder.write_record(conn, &table, record_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReferenceField, ReferenceIndexStore};
    use crate::infrastructure::sqlite::SqliteReferenceIndex;

    fn t(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    fn content_definition() -> TableDefinition {
        TableDefinition::with_references(vec![
            ReferenceField::new("pid", "pages"),
            ReferenceField::new("images", "sys_file"),
        ])
    }

    fn setup() -> (SqliteReferenceIndex, SqliteRecordIndexBuilder) {
        let store = SqliteReferenceIndex::in_memory(IndexLayout::default()).unwrap();
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE tt_content (uid INTEGER PRIMARY KEY, pid INTEGER, images TEXT);
                     INSERT INTO tt_content VALUES (1, 5, '7,8');
                     INSERT INTO tt_content VALUES (2, 0, NULL);
                     CREATE TABLE pages (uid INTEGER PRIMARY KEY, title TEXT);
                     INSERT INTO pages VALUES (5, 'home');",
                )
            })
            .unwrap();

        let mut registry = TableRegistry::new();
        registry.register(t("tt_content"), content_definition());
        registry.register(t("pages"), TableDefinition::default());
        let builder = store.record_builder(&registry);
        (store, builder)
    }

    #[test]
    fn test_extract_references_single_and_list() {
        let rows = extract_references(
            &t("tt_content"),
            1,
            &content_definition(),
            &[FieldValue::Integer(5), FieldValue::Text("7, 8,,0".to_string())],
        );

        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].field.as_str(), rows[0].ref_table.as_str()), ("pid", "pages"));
        assert_eq!(rows[0].ref_id, 5);
        assert_eq!((rows[1].ref_id, rows[1].sorting), (7, 0));
        assert_eq!((rows[2].ref_id, rows[2].sorting), (8, 1));
    }

    #[test]
    fn test_extract_references_skips_empty_values() {
        let rows = extract_references(
            &t("tt_content"),
            2,
            &content_definition(),
            &[FieldValue::Integer(0), FieldValue::Null],
        );
        assert!(rows.is_empty());

        let rows = extract_references(
            &t("tt_content"),
            2,
            &content_definition(),
            &[FieldValue::Other, FieldValue::Text("abc".to_string())],
        );
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_writes_rows() {
        let (store, builder) = setup();

        builder.rebuild(&t("tt_content"), 1).await.unwrap();

        let rows = store.index_rows(Some(&t("tt_content"))).unwrap();
        let refs: Vec<(&str, i64)> = rows.iter().map(|r| (r.field.as_str(), r.ref_id)).collect();
        assert_eq!(refs, vec![("images", 7), ("images", 8), ("pid", 5)]);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let (store, builder) = setup();

        builder.rebuild(&t("tt_content"), 1).await.unwrap();
        let first = store.index_rows(None).unwrap();
        builder.rebuild(&t("tt_content"), 1).await.unwrap();
        let second = store.index_rows(None).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_previous_rows() {
        let (store, builder) = setup();
        builder.rebuild(&t("tt_content"), 1).await.unwrap();

        store
            .with_connection(|conn| conn.execute("UPDATE tt_content SET images = '9' WHERE uid = 1", []))
            .unwrap();
        builder.rebuild(&t("tt_content"), 1).await.unwrap();

        let ids: Vec<i64> = store
            .index_rows(Some(&t("tt_content")))
            .unwrap()
            .iter()
            .map(|r| r.ref_id)
            .collect();
        assert_eq!(ids, vec![9, 5]);
    }

    #[tokio::test]
    async fn test_rebuild_record_without_references_clears_rows() {
        let (store, builder) = setup();
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO sys_refindex (tablename, recuid, field, ref_table, ref_uid)
                     VALUES ('tt_content', 2, 'pid', 'pages', 3)",
                    [],
                )
            })
            .unwrap();

        builder.rebuild(&t("tt_content"), 2).await.unwrap();
        assert!(store.index_rows(Some(&t("tt_content"))).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_unknown_record_or_table_yields_no_rows() {
        let (store, builder) = setup();

        builder.rebuild(&t("tt_content"), 404).await.unwrap();
        builder.rebuild(&t("pages"), 5).await.unwrap();
        builder.rebuild(&t("not_registered"), 1).await.unwrap();

        assert_eq!(store.count_rows().unwrap(), 0);
        assert!(store.indexed_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_missing_column_fails() {
        let store = SqliteReferenceIndex::in_memory(IndexLayout::default()).unwrap();
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE tt_content (uid INTEGER PRIMARY KEY, pid INTEGER);
                     INSERT INTO tt_content VALUES (1, 5);",
                )
            })
            .unwrap();
        let mut registry = TableRegistry::new();
        registry.register(t("tt_content"), content_definition());
        let builder = store.record_builder(&registry);

        let err = builder.rebuild(&t("tt_content"), 1).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Config);
        assert!(err.message.contains("has no column"));
    }
}
