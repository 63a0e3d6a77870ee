//! SQLite storage implementation
//!
//! This module provides the SQLite-backed results database. It implements
//! the [`Storage`] trait for run bookkeeping and both sink traits, so one
//! handle can be shared by every worker.

use crate::output::{DeadLetterSink, ResultSink, SinkResult};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{DeadLetterRecord, RunRecord, RunStatus};
use crate::task::{AttemptRecord, DeadLetter, DeadLetterReason, Outcome, TaskResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    /// Run that new rows are attributed to
    active_run: Mutex<Option<i64>>,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self::from_connection(conn))
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            active_run: Mutex::new(None),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_run(&self) -> Option<i64> {
        *self.active_run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(5)?;
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        node_id: row.get(4)?,
        status: RunStatus::from_db_string(&status).unwrap_or(RunStatus::Running),
    })
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&self, config_hash: &str, node_id: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (started_at, config_hash, node_id, status) VALUES (?1, ?2, ?3, ?4)",
            params![now, config_hash, node_id, RunStatus::Running.to_db_string()],
        )?;
        let run_id = conn.last_insert_rowid();
        *self.active_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run_id);
        Ok(run_id)
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn()
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, node_id, status
                 FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn()
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, node_id, status
                 FROM runs ORDER BY id DESC LIMIT 1",
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE runs SET finished_at = ?1, status = ?2 WHERE id = ?3",
            params![now, status.to_db_string(), run_id],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Statistics =====

    fn count_results(&self, run_id: i64) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM results WHERE run_id = ?1 AND outcome = 'success'",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn count_failed_attempts(&self, run_id: i64) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM results WHERE run_id = ?1 AND outcome != 'success'",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn get_dead_letters(&self, run_id: i64) -> StorageResult<Vec<DeadLetterRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, url, depth, attempt, reason, history, dead_lettered_at
             FROM dead_letters WHERE run_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (task_id, url, depth, attempt, reason, history, dead_lettered_at) = row?;
            let reason = DeadLetterReason::from_db_string(&reason).ok_or_else(|| {
                StorageError::Serialization(format!("unknown dead letter reason '{}'", reason))
            })?;
            let history: Vec<AttemptRecord> = serde_json::from_str(&history)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            records.push(DeadLetterRecord {
                task_id,
                url,
                depth,
                attempt,
                reason,
                history,
                dead_lettered_at,
            });
        }

        Ok(records)
    }
}

impl ResultSink for SqliteStorage {
    fn persist(&self, result: &TaskResult) -> SinkResult<()> {
        let task = &result.task;
        let response = match &result.outcome {
            Outcome::Success(response) => Some(response),
            _ => None,
        };

        self.conn()
            .execute(
                "INSERT INTO results (run_id, task_id, url, depth, attempt, outcome, cause,
                                      final_url, status_code, content_type, body_bytes,
                                      completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    self.active_run(),
                    task.id.to_string(),
                    task.url.as_str(),
                    task.depth,
                    task.attempt,
                    result.outcome.to_db_string(),
                    result.outcome.cause(),
                    response.map(|r| r.final_url.as_str()),
                    response.map(|r| r.status_code),
                    response.and_then(|r| r.content_type.as_deref()),
                    response.map(|r| i64::try_from(r.body.len()).unwrap_or(i64::MAX)),
                    result.completed_at.to_rfc3339(),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }
}

impl DeadLetterSink for SqliteStorage {
    fn record(&self, dead_letter: &DeadLetter) -> SinkResult<()> {
        let task = &dead_letter.task;
        let history = serde_json::to_string(&task.history)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO dead_letters (run_id, task_id, url, depth, attempt, reason,
                                           history, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    self.active_run(),
                    task.id.to_string(),
                    task.url.as_str(),
                    task.depth,
                    task.attempt,
                    dead_letter.reason.to_db_string(),
                    history,
                    dead_letter.dead_lettered_at.to_rfc3339(),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }
}
