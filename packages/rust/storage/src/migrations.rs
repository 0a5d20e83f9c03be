//! SQL migration definitions for the Siteflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: kv store, run history",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Definitions (pipeline:*, task:*) and collected datasets
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One row per pipeline/task execution
CREATE TABLE IF NOT EXISTS runs (
    id         TEXT PRIMARY KEY,
    parent_id  TEXT NOT NULL,
    kind       TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at   TEXT NOT NULL,
    status     TEXT NOT NULL,
    error      TEXT,
    records    INTEGER
);

CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_id, started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
