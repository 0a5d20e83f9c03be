//! In-memory registry of pipelines and tasks, written through to the store.
//!
//! Each mutation is read-modify-persist under the table lock: the row is
//! re-read from the store, the change is applied to that copy, persisted, and
//! only then committed in memory. A failed write leaves both sides unchanged,
//! and a row deleted or changed by another process is never overwritten with
//! a stale cached copy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use siteflow_shared::{
    EntityId, EntityKind, NewPipeline, NewTask, Pipeline, Result, SiteflowError, Task,
};
use siteflow_storage::PersistenceStore;

/// An entity kept in the registry.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> EntityId;
    fn created_at(&self) -> DateTime<Utc>;

    fn key_for(id: &EntityId) -> String {
        format!("{}:{id}", Self::KIND.as_str())
    }
}

impl Entity for Pipeline {
    const KIND: EntityKind = EntityKind::Pipeline;

    fn id(&self) -> EntityId {
        self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> EntityId {
        self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

struct Table<T> {
    rows: Mutex<HashMap<EntityId, T>>,
}

impl<T: Entity> Table<T> {
    fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

/// Owner of all pipeline and task definitions.
pub struct Registry {
    store: Arc<dyn PersistenceStore>,
    pipelines: Table<Pipeline>,
    tasks: Table<Task>,
}

impl Registry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            pipelines: Table::new(),
            tasks: Table::new(),
        }
    }

    /// Load every persisted entity. Unreadable entries are logged and skipped.
    pub async fn load(&self) -> Result<(usize, usize)> {
        let pipelines = self.load_table(&self.pipelines).await?;
        let tasks = self.load_table(&self.tasks).await?;
        info!(pipelines, tasks, "registry loaded");
        Ok((pipelines, tasks))
    }

    async fn load_table<T: Entity>(&self, table: &Table<T>) -> Result<usize> {
        let prefix = format!("{}:", T::KIND.as_str());
        let mut rows = table.rows.lock().await;
        rows.clear();

        for key in self.store.keys(&prefix).await? {
            let value = match self.store.get(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            match serde_json::from_value::<T>(value) {
                Ok(entity) => {
                    rows.insert(entity.id(), entity);
                }
                Err(e) => warn!(%key, error = %e, "skipping unreadable entry"),
            }
        }
        Ok(rows.len())
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    /// Register a new pipeline. Identical definitions get distinct ids.
    pub async fn create_pipeline(&self, def: NewPipeline, now: DateTime<Utc>) -> Result<Pipeline> {
        if def.name.trim().is_empty() {
            return Err(SiteflowError::validation("pipeline name must not be empty"));
        }
        if def.sites.is_empty() {
            return Err(SiteflowError::validation("pipeline needs at least one site"));
        }

        let mut pipeline = Pipeline::from_definition(def, now);
        if let Some(schedule) = &pipeline.schedule {
            let next = schedule.next_after(now)?;
            pipeline.next_run = pipeline.enabled.then_some(next);
        }

        self.insert(&self.pipelines, pipeline).await
    }

    pub async fn pipeline(&self, id: &EntityId) -> Option<Pipeline> {
        self.pipelines.rows.lock().await.get(id).cloned()
    }

    /// All pipelines, oldest first.
    pub async fn pipelines(&self) -> Vec<Pipeline> {
        Self::list(&self.pipelines).await
    }

    pub async fn update_pipeline(
        &self,
        id: &EntityId,
        change: impl FnOnce(&mut Pipeline),
    ) -> Result<Pipeline> {
        self.update(&self.pipelines, id, change).await
    }

    /// Apply `change` only if it returns `true`. `None` when the pipeline is
    /// gone or the change was declined.
    pub async fn update_pipeline_if(
        &self,
        id: &EntityId,
        change: impl FnOnce(&mut Pipeline) -> bool,
    ) -> Result<Option<Pipeline>> {
        self.update_if(&self.pipelines, id, change).await
    }

    /// Re-read one pipeline from the store, dropping it if it was deleted.
    pub async fn refresh_pipeline(&self, id: &EntityId) -> Result<Option<Pipeline>> {
        self.refresh(&self.pipelines, id).await
    }

    pub async fn delete_pipeline(&self, id: &EntityId) -> Result<bool> {
        self.remove(&self.pipelines, id).await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Register a new task. A malformed schedule is rejected here.
    pub async fn create_task(&self, def: NewTask, now: DateTime<Utc>) -> Result<Task> {
        if def.name.trim().is_empty() {
            return Err(SiteflowError::validation("task name must not be empty"));
        }
        if def.max_runs == Some(0) {
            return Err(SiteflowError::validation("max_runs must be at least 1"));
        }

        let next = def.schedule.next_after(now)?;
        let mut task = Task::from_definition(def, now);
        task.next_run = task.enabled.then_some(next);

        self.insert(&self.tasks, task).await
    }

    pub async fn task(&self, id: &EntityId) -> Option<Task> {
        self.tasks.rows.lock().await.get(id).cloned()
    }

    /// All tasks, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        Self::list(&self.tasks).await
    }

    pub async fn update_task(&self, id: &EntityId, change: impl FnOnce(&mut Task)) -> Result<Task> {
        self.update(&self.tasks, id, change).await
    }

    pub async fn update_task_if(
        &self,
        id: &EntityId,
        change: impl FnOnce(&mut Task) -> bool,
    ) -> Result<Option<Task>> {
        self.update_if(&self.tasks, id, change).await
    }

    /// Re-read one task from the store, dropping it if it was deleted.
    pub async fn refresh_task(&self, id: &EntityId) -> Result<Option<Task>> {
        self.refresh(&self.tasks, id).await
    }

    pub async fn delete_task(&self, id: &EntityId) -> Result<bool> {
        self.remove(&self.tasks, id).await
    }

    // -----------------------------------------------------------------------
    // Generic table operations
    // -----------------------------------------------------------------------

    async fn persist<T: Entity>(&self, entity: &T) -> Result<()> {
        let value = serde_json::to_value(entity)
            .map_err(|e| SiteflowError::Storage(format!("serialize {}: {e}", T::KIND.as_str())))?;
        self.store.set(&T::key_for(&entity.id()), &value).await
    }

    async fn insert<T: Entity>(&self, table: &Table<T>, entity: T) -> Result<T> {
        let mut rows = table.rows.lock().await;
        self.persist(&entity).await?;
        rows.insert(entity.id(), entity.clone());
        info!(kind = T::KIND.as_str(), id = %entity.id(), "registered");
        Ok(entity)
    }

    /// The stored row for `id`, mirrored into `rows`. Another process may
    /// have changed or deleted it since this registry loaded.
    async fn current<T: Entity>(
        &self,
        rows: &mut HashMap<EntityId, T>,
        id: &EntityId,
    ) -> Result<Option<T>> {
        let stored = match self.store.get(&T::key_for(id)).await? {
            Some(value) => Some(serde_json::from_value::<T>(value).map_err(|e| {
                SiteflowError::Storage(format!("unreadable {} {id}: {e}", T::KIND.as_str()))
            })?),
            None => None,
        };
        match &stored {
            Some(entity) => {
                rows.insert(*id, entity.clone());
            }
            None => {
                if rows.remove(id).is_some() {
                    debug!(kind = T::KIND.as_str(), %id, "deleted elsewhere, dropped");
                }
            }
        }
        Ok(stored)
    }

    async fn refresh<T: Entity>(&self, table: &Table<T>, id: &EntityId) -> Result<Option<T>> {
        let mut rows = table.rows.lock().await;
        self.current(&mut rows, id).await
    }

    async fn update<T: Entity>(
        &self,
        table: &Table<T>,
        id: &EntityId,
        change: impl FnOnce(&mut T),
    ) -> Result<T> {
        self.update_if(table, id, |entity| {
            change(entity);
            true
        })
        .await?
        .ok_or_else(|| SiteflowError::NotFound(format!("{} {id}", T::KIND.as_str())))
    }

    /// Read-modify-persist against the store under the table lock.
    async fn update_if<T: Entity>(
        &self,
        table: &Table<T>,
        id: &EntityId,
        change: impl FnOnce(&mut T) -> bool,
    ) -> Result<Option<T>> {
        let mut rows = table.rows.lock().await;
        let Some(mut updated) = self.current(&mut rows, id).await? else {
            return Ok(None);
        };
        if !change(&mut updated) {
            return Ok(None);
        }
        self.persist(&updated).await?;
        rows.insert(*id, updated.clone());
        Ok(Some(updated))
    }

    async fn remove<T: Entity>(&self, table: &Table<T>, id: &EntityId) -> Result<bool> {
        let mut rows = table.rows.lock().await;
        let key = T::key_for(id);
        if self.store.get(&key).await?.is_none() {
            rows.remove(id);
            return Ok(false);
        }
        self.store.delete(&key).await?;
        rows.remove(id);
        info!(kind = T::KIND.as_str(), %id, "deleted");
        Ok(true)
    }

    async fn list<T: Entity>(table: &Table<T>) -> Vec<T> {
        let mut all: Vec<T> = table.rows.lock().await.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at(), e.id()));
        all
    }
}
