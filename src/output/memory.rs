//! In-memory sink, for embedding the scheduler and for tests

use crate::output::traits::{DeadLetterSink, ResultSink, SinkResult};
use crate::task::{DeadLetter, TaskResult};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Collects results and dead letters in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<TaskResult>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded results, in arrival order
    pub fn results(&self) -> Vec<TaskResult> {
        lock(&self.results).clone()
    }

    /// Snapshot of the recorded dead letters, in arrival order
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResultSink for MemorySink {
    fn persist(&self, result: &TaskResult) -> SinkResult<()> {
        lock(&self.results).push(result.clone());
        Ok(())
    }
}

impl DeadLetterSink for MemorySink {
    fn record(&self, dead_letter: &DeadLetter) -> SinkResult<()> {
        lock(&self.dead_letters).push(dead_letter.clone());
        Ok(())
    }
}
