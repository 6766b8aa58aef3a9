//! Schedulable "update reference index" task
//!
//! The task only carries the operator's choice (all tables, or an explicit
//! list) and hands it to whatever [`ReferenceIndexUpdater`] it is executed
//! against.

use async_trait::async_trait;
use refindex_storage::TableName;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ReconcileConfig;
use crate::error::Result;
use crate::run::RunResult;

/// Anything that can reconcile the index for an optional table selection
#[async_trait]
pub trait ReferenceIndexUpdater: Send + Sync {
    async fn update(&self, selection: Option<&[TableName]>) -> Result<RunResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRefIndexTask {
    pub update_all_tables: bool,
    pub selected_tables: Vec<TableName>,
}

impl Default for UpdateRefIndexTask {
    fn default() -> Self {
        Self {
            update_all_tables: true,
            selected_tables: Vec::new(),
        }
    }
}

impl UpdateRefIndexTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            update_all_tables: config.update_all_tables,
            selected_tables: config.selected_tables.clone(),
        }
    }

    pub fn set_update_all_tables(&mut self, update_all_tables: bool) -> &mut Self {
        self.update_all_tables = update_all_tables;
        self
    }

    /// Select explicit tables; this turns "update all" off
    pub fn set_selected_tables(&mut self, tables: Vec<TableName>) -> &mut Self {
        self.update_all_tables = false;
        self.selected_tables = tables;
        self
    }

    /// Selection handed to the updater (`None` = every eligible table)
    pub fn selection(&self) -> Option<&[TableName]> {
        if self.update_all_tables || self.selected_tables.is_empty() {
            None
        } else {
            Some(self.selected_tables.as_slice())
        }
    }

    pub async fn execute(&self, updater: &dyn ReferenceIndexUpdater) -> Result<RunResult> {
        info!("Executing task: {}", self.additional_information());
        updater.update(self.selection()).await
    }

    /// One-line description for task listings
    pub fn additional_information(&self) -> String {
        match self.selection() {
            None => "Update reference index of all tables".to_string(),
            Some(tables) => format!(
                "Update reference index of tables: {}",
                tables
                    .iter()
                    .map(TableName::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Records every selection it is asked to update
    #[derive(Default)]
    struct RecordingUpdater {
        calls: Mutex<Vec<Option<Vec<TableName>>>>,
    }

    #[async_trait]
    impl ReferenceIndexUpdater for RecordingUpdater {
        async fn update(&self, selection: Option<&[TableName]>) -> Result<RunResult> {
            self.calls.lock().unwrap().push(selection.map(<[TableName]>::to_vec));
            let now = Utc::now();
            Ok(RunResult {
                run_id: Uuid::new_v4(),
                started_at: now,
                finished_at: now,
                working_set: Vec::new(),
                ignored_selection: Vec::new(),
                tables: Vec::new(),
                swept_rows: 0,
                errors: Vec::new(),
            })
        }
    }

    fn tables(names: &[&str]) -> Vec<TableName> {
        names.iter().map(|name| TableName::new(*name).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_execute_with_selected_tables() {
        let updater = RecordingUpdater::default();
        let mut task = UpdateRefIndexTask::new();
        task.set_selected_tables(tables(&["table1", "table2"]));

        task.execute(&updater).await.unwrap();

        let calls = updater.calls.lock().unwrap();
        assert_eq!(*calls, vec![Some(tables(&["table1", "table2"]))]);
    }

    #[tokio::test]
    async fn test_execute_with_update_all_tables() {
        let updater = RecordingUpdater::default();
        let mut task = UpdateRefIndexTask::new();
        task.set_selected_tables(tables(&["table1"]))
            .set_update_all_tables(true);

        task.execute(&updater).await.unwrap();

        assert_eq!(*updater.calls.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_empty_selection_means_all() {
        let mut task = UpdateRefIndexTask::new();
        task.set_selected_tables(Vec::new());
        assert_eq!(task.selection(), None);
    }

    #[test]
    fn test_additional_information() {
        let mut task = UpdateRefIndexTask::new();
        assert_eq!(
            task.additional_information(),
            "Update reference index of all tables"
        );

        task.set_selected_tables(tables(&["pages", "tt_content"]));
        assert_eq!(
            task.additional_information(),
            "Update reference index of tables: pages, tt_content"
        );
    }

    #[test]
    fn test_from_config() {
        let config = ReconcileConfig::from_yaml_str(
            "version: 1\nupdate_all_tables: false\nselected_tables: [pages]\n",
        )
        .unwrap();
        let task = UpdateRefIndexTask::from_config(&config);
        assert_eq!(task.selection(), Some(&tables(&["pages"])[..]));
    }
}
