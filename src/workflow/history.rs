use chrono::{NaiveDate, Utc};
use std::path::Path;
use tracing::debug;

use crate::core::errors::Result;
use crate::storage::SledStore;
use crate::workflow::model::Workflow;

const HISTORY_TREE: &str = "workflow_history";

/// Audit sink for terminal workflow snapshots
///
/// One record per workflow and day, keyed `{workflow_id}_{YYYYMMDD}`; saving
/// again on the same day replaces the record.
#[derive(Debug, Clone)]
pub struct WorkflowHistory {
    store: SledStore,
}

impl WorkflowHistory {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(SledStore::open(path)?))
    }

    pub fn key(workflow_id: &str, date: NaiveDate) -> String {
        format!("{}_{}", workflow_id, date.format("%Y%m%d"))
    }

    pub fn save(&self, workflow: &Workflow) -> Result<String> {
        let key = Self::key(&workflow.id, Utc::now().date_naive());
        self.store.put_json(HISTORY_TREE, &key, workflow)?;
        self.store.flush()?;
        debug!(workflow_id = %workflow.id, key = %key, "Saved workflow history");
        Ok(key)
    }

    pub fn load(&self, workflow_id: &str, date: NaiveDate) -> Result<Option<Workflow>> {
        self.store
            .get_json(HISTORY_TREE, &Self::key(workflow_id, date))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.store.keys(HISTORY_TREE)
    }
}
