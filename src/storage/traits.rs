//! Storage traits and error types
//!
//! This module defines the trait interface for the results database and
//! associated error types.

use crate::storage::{DeadLetterRecord, RunRecord, RunStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Run bookkeeping and read access to a results database
///
/// Writes of individual results go through the
/// [`ResultSink`](crate::output::ResultSink) and
/// [`DeadLetterSink`](crate::output::DeadLetterSink) traits.
pub trait Storage: Send + Sync {
    // ===== Run Management =====

    /// Creates a new crawl run and makes it the target of subsequent writes
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    /// * `node_id` - Identity of the process performing the run
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&self, config_hash: &str, node_id: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Records the final status of a run with a finish timestamp
    fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Statistics =====

    /// Number of successful results recorded for a run
    fn count_results(&self, run_id: i64) -> StorageResult<u64>;

    /// Number of failed fetch attempts recorded for a run, retried or not
    fn count_failed_attempts(&self, run_id: i64) -> StorageResult<u64>;

    /// Dead letters recorded for a run, oldest first
    fn get_dead_letters(&self, run_id: i64) -> StorageResult<Vec<DeadLetterRecord>>;
}
