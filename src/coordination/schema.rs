//! Schema of the shared coordination database
//!
//! Times are stored as Unix milliseconds so due and expiry checks are plain
//! integer comparisons inside SQLite.

use rusqlite::Connection;

pub const SCHEMA_SQL: &str = r#"
-- One row per task, shared by every node
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    canonical_key TEXT NOT NULL,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    priority INTEGER,
    attempt INTEGER NOT NULL DEFAULT 0,
    history TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL,
    enqueued_ms INTEGER NOT NULL,
    due_ms INTEGER NOT NULL,
    holder TEXT,
    generation INTEGER NOT NULL DEFAULT 0,
    lease_expires_ms INTEGER,
    dead_letter_reason TEXT,
    updated_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_state_due ON tasks(state, due_ms);
CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks(state, lease_expires_ms);

-- Cluster-wide dedup set
CREATE TABLE IF NOT EXISTS seen_keys (
    canonical_key TEXT PRIMARY KEY,
    first_seen_ms INTEGER NOT NULL
);
"#;

/// Creates the coordination tables if they do not exist
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
