/// A schema migration.
#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

const MIGRATION_001: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Ingestion runs (one row per sources/external id/day)
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sources TEXT NOT NULL,
    external_id TEXT NOT NULL,
    run_day TEXT NOT NULL,
    etag TEXT,
    last_modified TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (sources, external_id, run_day)
);

CREATE INDEX IF NOT EXISTS idx_ingestion_runs_lookup
    ON ingestion_runs(sources, external_id, run_day DESC, id DESC);
"#;

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "ingestion_runs",
    sql: MIGRATION_001,
}];
