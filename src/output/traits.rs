//! Sink traits and error types
//!
//! Sinks are append-only destinations for what the worker pool produces.
//! They are called from worker tasks and must be thread-safe.

use crate::storage::StorageError;
use crate::task::{DeadLetter, TaskResult};
use thiserror::Error;

/// Errors that can occur while writing to a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Record rejected: {0}")]
    Rejected(String),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for successful task results
pub trait ResultSink: Send + Sync {
    /// Records one successful fetch
    fn persist(&self, result: &TaskResult) -> SinkResult<()>;
}

/// Destination for tasks that will never be retried
pub trait DeadLetterSink: Send + Sync {
    /// Records a dead letter with its full attempt history
    fn record(&self, dead_letter: &DeadLetter) -> SinkResult<()>;
}
