//! Storage module for persisting crawl results
//!
//! This module handles the results database:
//! - SQLite database initialization and schema management
//! - Crawl run tracking
//! - Successful results and dead letters (see [`crate::output`] for the
//!   sink traits it implements)

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::task::{AttemptRecord, DeadLetterReason};
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(StorageError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub node_id: String,
    pub status: RunStatus,
}

/// A dead letter as stored in the database
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub task_id: String,
    pub url: String,
    pub depth: u32,
    pub attempt: u32,
    pub reason: DeadLetterReason,
    pub history: Vec<AttemptRecord>,
    pub dead_lettered_at: String,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// The queue ran dry
    Completed,
    /// Stopped on request, in-flight work drained or abandoned
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
