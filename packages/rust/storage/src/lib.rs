//! Persistence layer: a JSON key/value store plus run history.
//!
//! [`PersistenceStore`] is the interface the engine depends on. Two
//! implementations ship with the crate:
//! - [`Storage`]: a local libSQL database (sole writer: the running process)
//! - [`MemoryStore`]: an in-process map for tests and throwaway runs
//!
//! Key layout: `pipeline:{id}`, `task:{id}`, `dataset:{pipeline}:{ts}`,
//! `extract:{task}:{ts}`, `screenshot:{task}:{ts}`, `analysis:{task}:{ts}`.

mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use serde_json::Value;

use siteflow_shared::{EntityId, EntityKind, Result, RunRecord, SiteflowError};

pub use memory::MemoryStore;

/// Key/value persistence over JSON values, plus run history.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read a value, `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    /// Insert or replace a value.
    async fn set(&self, key: &str, value: &Value) -> Result<()>;
    /// Remove a key; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    /// Append a finished run.
    async fn record_run(&self, run: &RunRecord) -> Result<()>;
    /// Most recent runs of one pipeline/task, newest first.
    async fn list_runs(&self, parent_id: &EntityId, limit: u32) -> Result<Vec<RunRecord>>;
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiteflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    SiteflowError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }
}

#[async_trait]
impl PersistenceStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut rows = self
            .conn
            .query("SELECT value_json FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| SiteflowError::Storage(e.to_string()))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| SiteflowError::Storage(format!("corrupt value at {key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SiteflowError::Storage(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let json = value.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO kv (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![key, json.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                params![prefix],
            )
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(
                row.get::<String>(0)
                    .map_err(|e| SiteflowError::Storage(e.to_string()))?,
            );
        }
        Ok(results)
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, parent_id, kind, started_at, ended_at, status, error, records)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.id.to_string(),
                    run.parent_id.to_string(),
                    run.kind.as_str(),
                    run.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    run.ended_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    run.status.as_str(),
                    run.error.as_deref(),
                    run.records.map(|r| r as i64),
                ],
            )
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_runs(&self, parent_id: &EntityId, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, parent_id, kind, started_at, ended_at, status, error, records
                 FROM runs WHERE parent_id = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2",
                params![parent_id.to_string(), limit],
            )
            .await
            .map_err(|e| SiteflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }
}

/// Convert a database row to a [`RunRecord`].
fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| SiteflowError::Storage(e.to_string()))
    };

    Ok(RunRecord {
        id: parse_id(&text(0)?)?,
        parent_id: parse_id(&text(1)?)?,
        kind: match text(2)?.as_str() {
            "pipeline" => EntityKind::Pipeline,
            "task" => EntityKind::Task,
            other => {
                return Err(SiteflowError::Storage(format!("unknown run kind: {other}")));
            }
        },
        started_at: parse_time(&text(3)?)?,
        ended_at: parse_time(&text(4)?)?,
        status: text(5)?.parse().map_err(SiteflowError::Storage)?,
        error: row.get::<String>(6).ok(),
        records: row.get::<i64>(7).ok().map(|v| v as u64),
    })
}

fn parse_id(s: &str) -> Result<EntityId> {
    s.parse()
        .map_err(|e| SiteflowError::Storage(format!("invalid id {s}: {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SiteflowError::Storage(format!("invalid date: {e}")))
}
