//! Table-definition registry
//!
//! The set of tables eligible for indexing, with the reference columns each
//! one declares. Built from configuration and handed to the reconciler
//! explicitly; there is no process-wide instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{TableCatalog, TableDefinition, TableName};
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRegistry {
    tables: BTreeMap<TableName, TableDefinition>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(tables: BTreeMap<TableName, TableDefinition>) -> Self {
        Self { tables }
    }

    /// Register (or replace) a table definition
    pub fn register(&mut self, table: TableName, definition: TableDefinition) {
        self.tables.insert(table, definition);
    }

    pub fn remove(&mut self, table: &TableName) -> Option<TableDefinition> {
        self.tables.remove(table)
    }

    pub fn get(&self, table: &TableName) -> Option<&TableDefinition> {
        self.tables.get(table)
    }

    pub fn contains(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// Registered table names in ascending order
    pub fn table_names(&self) -> Vec<TableName> {
        self.tables.keys().cloned().collect()
    }

    pub fn definitions(&self) -> &BTreeMap<TableName, TableDefinition> {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.tables.values().try_for_each(TableDefinition::validate)
    }
}

#[async_trait]
impl TableCatalog for TableRegistry {
    async fn list_eligible_tables(&self) -> Result<Vec<TableName>> {
        Ok(self.table_names())
    }
}
