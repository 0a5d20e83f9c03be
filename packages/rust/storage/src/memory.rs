//! In-process [`PersistenceStore`] backed by a sorted map.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use siteflow_shared::{EntityId, Result, RunRecord};

use crate::PersistenceStore;

/// Non-durable store; contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    runs: RwLock<Vec<RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, parent_id: &EntityId, limit: u32) -> Result<Vec<RunRecord>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<RunRecord> = runs
            .iter()
            .filter(|r| &r.parent_id == parent_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit as usize);
        Ok(matching)
    }
}
