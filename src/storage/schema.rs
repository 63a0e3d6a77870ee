//! Database schema for crawl results
//!
//! This module contains the SQL schema for the results database: crawl
//! runs, fetch attempts and dead letters.

use rusqlite::Connection;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL
);

-- One row per fetch attempt; response columns are NULL for failures
CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER REFERENCES runs(id),
    task_id TEXT NOT NULL,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    cause TEXT,
    final_url TEXT,
    status_code INTEGER,
    content_type TEXT,
    body_bytes INTEGER,
    completed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id, outcome);
CREATE INDEX IF NOT EXISTS idx_results_url ON results(url);

-- Tasks that will never be retried, with their full attempt history
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER REFERENCES runs(id),
    task_id TEXT NOT NULL,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    reason TEXT NOT NULL,
    history TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_run ON dead_letters(run_id);
CREATE INDEX IF NOT EXISTS idx_dead_letters_reason ON dead_letters(reason);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
