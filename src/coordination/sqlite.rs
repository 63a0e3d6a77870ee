//! SQLite implementation of the coordination store
//!
//! All nodes open the same database file. Leasing runs inside an IMMEDIATE
//! transaction, which takes SQLite's write lock up front, so two nodes can
//! never select and claim the same row.

use crate::coordination::schema::initialize_schema;
use crate::coordination::{
    AckOutcome, Consistency, CoordinationError, CoordinationResult, CoordinationStore, Lease,
    PushOutcome, QueueCounts,
};
use crate::task::{AttemptRecord, CanonicalKey, DeadLetterReason, Task, TaskId, TaskState};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// How long a statement waits on another node's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables of the shared store
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Lifetime of a `seen_keys` record; `None` keeps keys forever
    pub dedup_ttl: Option<Duration>,
    /// Extra age an expired lease needs before it is handed to another node
    pub clock_skew_tolerance: Duration,
}

/// Coordination store backed by one SQLite file shared by all nodes
pub struct SqliteCoordinationStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl SqliteCoordinationStore {
    /// Opens (or creates) the shared database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite file every node uses
    /// * `options` - Dedup TTL and clock skew tolerance
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteCoordinationStore)` - Database opened and schema ready
    /// * `Err(CoordinationError::Unavailable)` - The file could not be opened
    pub fn open(path: &Path, options: StoreOptions) -> CoordinationResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        ",
        )?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// Creates an in-memory store (for testing)
    #[cfg(test)]
    pub fn new_in_memory(options: StoreOptions) -> CoordinationResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seen-key records at or before this time are expired and may be
    /// claimed again
    fn dedup_cutoff_ms(&self, now_ms: i64) -> i64 {
        match self.options.dedup_ttl {
            Some(ttl) => now_ms.saturating_sub(duration_ms(ttl)),
            None => i64::MIN,
        }
    }

    /// Applies a settlement `UPDATE` guarded by the lease triple
    ///
    /// The statement must end with `WHERE id = ?1 AND holder = ?2 AND
    /// generation = ?3 AND state = 'leased'` and may bind further parameters
    /// starting at `?4`.
    fn settle(
        &self,
        lease: &Lease,
        sql: &str,
        extra: &[&dyn rusqlite::ToSql],
    ) -> CoordinationResult<AckOutcome> {
        let id = lease.task.id.to_string();
        let generation = to_i64(lease.generation);
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&id, &lease.holder, &generation];
        bound.extend_from_slice(extra);

        let changed = self.lock().execute(sql, bound.as_slice())?;
        let outcome = match changed {
            0 => AckOutcome::Stale,
            1 => AckOutcome::Acknowledged,
            n => {
                return Err(CoordinationError::Inconsistent(format!(
                    "{} rows matched lease on task {}",
                    n, lease.task.id
                )))
            }
        };

        if outcome == AckOutcome::Stale {
            debug!(
                "Stale lease on task {} (holder {}, generation {})",
                lease.task.id, lease.holder, lease.generation
            );
        }
        Ok(outcome)
    }
}

impl CoordinationStore for SqliteCoordinationStore {
    fn push_at(&self, task: &Task, now: DateTime<Utc>) -> CoordinationResult<()> {
        insert_task(&self.lock(), task, now)
    }

    fn mark_if_new_at(&self, key: &CanonicalKey, now: DateTime<Utc>) -> CoordinationResult<bool> {
        let now_ms = now.timestamp_millis();
        mark_key(&self.lock(), key, now_ms, self.dedup_cutoff_ms(now_ms))
    }

    fn push_if_new_at(
        &self,
        task: &Task,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> CoordinationResult<PushOutcome> {
        let now_ms = now.timestamp_millis();
        let cutoff_ms = self.dedup_cutoff_ms(now_ms);

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let seen = tx
            .query_row(
                "SELECT 1 FROM seen_keys WHERE canonical_key = ?1 AND first_seen_ms > ?2",
                params![task.key.as_str(), cutoff_ms],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if seen {
            return Ok(PushOutcome::Duplicate);
        }

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE state = ?1",
            params![TaskState::Pending.to_db_string()],
            |row| row.get(0),
        )?;
        if usize::try_from(pending).unwrap_or(usize::MAX) >= capacity {
            return Ok(PushOutcome::Full);
        }

        if !mark_key(&tx, &task.key, now_ms, cutoff_ms)? {
            return Err(CoordinationError::Inconsistent(format!(
                "key {} claimed inside a write transaction",
                task.key
            )));
        }
        insert_task(&tx, task, now)?;
        tx.commit()?;
        Ok(PushOutcome::Pushed)
    }

    fn lease_pop_at(
        &self,
        node: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        let now_ms = now.timestamp_millis();
        let skew_ms = duration_ms(self.options.clock_skew_tolerance);
        let expires_ms = now_ms.saturating_add(duration_ms(lease_duration));

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT id, url, depth, priority, attempt, history, enqueued_ms, generation
                 FROM tasks
                 WHERE (state = ?1 AND due_ms <= ?3)
                    OR (state = ?2 AND lease_expires_ms + ?4 <= ?3)
                 ORDER BY COALESCE(priority, depth), enqueued_ms, id
                 LIMIT 1",
                params![
                    TaskState::Pending.to_db_string(),
                    TaskState::Leased.to_db_string(),
                    now_ms,
                    skew_ms
                ],
                |row| {
                    Ok(TaskRow {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        depth: row.get(2)?,
                        priority: row.get(3)?,
                        attempt: row.get(4)?,
                        history: row.get(5)?,
                        enqueued_ms: row.get(6)?,
                        generation: row.get(7)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let generation = row.generation.saturating_add(1);
        tx.execute(
            "UPDATE tasks
             SET state = ?2, holder = ?3, generation = ?4, lease_expires_ms = ?5, updated_ms = ?6
             WHERE id = ?1",
            params![
                row.id,
                TaskState::Leased.to_db_string(),
                node,
                generation,
                expires_ms,
                now_ms
            ],
        )?;
        tx.commit()?;
        drop(conn);

        let task = row.into_task()?;
        let expires_at = from_millis(expires_ms)?;
        debug!("Node {} leased task {} (generation {})", node, task.id, generation);

        Ok(Some(Lease {
            task,
            holder: node.to_string(),
            generation: u64::try_from(generation).map_err(|_| {
                CoordinationError::Inconsistent(format!("negative generation {}", generation))
            })?,
            expires_at,
        }))
    }

    fn ack_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome> {
        let state = TaskState::Succeeded.to_db_string();
        let now_ms = now.timestamp_millis();
        self.settle(
            lease,
            "UPDATE tasks
             SET state = ?4, holder = NULL, lease_expires_ms = NULL, updated_ms = ?5
             WHERE id = ?1 AND holder = ?2 AND generation = ?3 AND state = 'leased'",
            &[&state, &now_ms],
        )
    }

    fn nack_at(
        &self,
        lease: &Lease,
        task: &Task,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome> {
        let state = TaskState::Pending.to_db_string();
        let history = encode_history(&task.history)?;
        let now_ms = now.timestamp_millis();
        let due_ms = now_ms.saturating_add(duration_ms(delay));
        self.settle(
            lease,
            "UPDATE tasks
             SET state = ?4, attempt = ?5, history = ?6, due_ms = ?7, holder = NULL,
                 lease_expires_ms = NULL, updated_ms = ?8
             WHERE id = ?1 AND holder = ?2 AND generation = ?3 AND state = 'leased'",
            &[&state, &task.attempt, &history, &due_ms, &now_ms],
        )
    }

    fn dead_letter_at(
        &self,
        lease: &Lease,
        task: &Task,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome> {
        let state = TaskState::DeadLettered.to_db_string();
        let reason = reason.to_db_string();
        let history = encode_history(&task.history)?;
        let now_ms = now.timestamp_millis();
        self.settle(
            lease,
            "UPDATE tasks
             SET state = ?4, attempt = ?5, history = ?6, dead_letter_reason = ?7,
                 holder = NULL, lease_expires_ms = NULL, updated_ms = ?8
             WHERE id = ?1 AND holder = ?2 AND generation = ?3 AND state = 'leased'",
            &[&state, &task.attempt, &history, &reason, &now_ms],
        )
    }

    fn release_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome> {
        let state = TaskState::Pending.to_db_string();
        let now_ms = now.timestamp_millis();
        self.settle(
            lease,
            "UPDATE tasks
             SET state = ?4, due_ms = ?5, holder = NULL, lease_expires_ms = NULL, updated_ms = ?5
             WHERE id = ?1 AND holder = ?2 AND generation = ?3 AND state = 'leased'",
            &[&state, &now_ms],
        )
    }

    fn counts(&self) -> CoordinationResult<QueueCounts> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match TaskState::from_db_string(&state) {
                Some(TaskState::Pending) => counts.pending = count,
                Some(TaskState::Leased) => counts.leased = count,
                Some(TaskState::Succeeded) => counts.succeeded = count,
                Some(TaskState::DeadLettered) => counts.dead_lettered = count,
                None => {
                    return Err(CoordinationError::Inconsistent(format!(
                        "unknown task state '{}'",
                        state
                    )))
                }
            }
        }
        Ok(counts)
    }

    fn consistency(&self) -> Consistency {
        Consistency::Strong
    }
}

fn insert_task(conn: &Connection, task: &Task, now: DateTime<Utc>) -> CoordinationResult<()> {
    let history = encode_history(&task.history)?;
    conn.execute(
        "INSERT INTO tasks (id, canonical_key, url, depth, priority, attempt, history,
                            state, enqueued_ms, due_ms, updated_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            task.id.to_string(),
            task.key.as_str(),
            task.url.as_str(),
            task.depth,
            task.priority,
            task.attempt,
            history,
            TaskState::Pending.to_db_string(),
            task.enqueued_at.timestamp_millis(),
            now.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Claims `key` unless a live record exists; true if it was claimed
fn mark_key(
    conn: &Connection,
    key: &CanonicalKey,
    now_ms: i64,
    cutoff_ms: i64,
) -> CoordinationResult<bool> {
    let changed = conn.execute(
        "INSERT INTO seen_keys (canonical_key, first_seen_ms) VALUES (?1, ?2)
         ON CONFLICT(canonical_key) DO UPDATE SET first_seen_ms = excluded.first_seen_ms
         WHERE seen_keys.first_seen_ms <= ?3",
        params![key.as_str(), now_ms, cutoff_ms],
    )?;
    Ok(changed == 1)
}

/// Raw columns of a leasable task row
struct TaskRow {
    id: String,
    url: String,
    depth: u32,
    priority: Option<u32>,
    attempt: u32,
    history: String,
    enqueued_ms: i64,
    generation: i64,
}

impl TaskRow {
    fn into_task(self) -> CoordinationResult<Task> {
        let id = TaskId::parse(&self.id)
            .ok_or_else(|| CoordinationError::Inconsistent(format!("bad task id '{}'", self.id)))?;
        let url = Url::parse(&self.url).map_err(|e| {
            CoordinationError::Inconsistent(format!("bad url '{}' on task {}: {}", self.url, id, e))
        })?;
        let history: Vec<AttemptRecord> = serde_json::from_str(&self.history).map_err(|e| {
            CoordinationError::Inconsistent(format!("bad history on task {}: {}", id, e))
        })?;

        Ok(Task {
            id,
            key: CanonicalKey::from_url(&url),
            url,
            depth: self.depth,
            attempt: self.attempt,
            enqueued_at: from_millis(self.enqueued_ms)?,
            priority: self.priority,
            history,
        })
    }
}

fn encode_history(history: &[AttemptRecord]) -> CoordinationResult<String> {
    serde_json::to_string(history)
        .map_err(|e| CoordinationError::Inconsistent(format!("unencodable history: {}", e)))
}

fn from_millis(ms: i64) -> CoordinationResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CoordinationError::Inconsistent(format!("timestamp out of range: {}", ms)))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
