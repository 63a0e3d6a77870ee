//! Shared work queue for several crawler processes
//!
//! In distributed mode every node leases tasks from one [`CoordinationStore`]
//! instead of a local frontier. A lease names its holder and carries a
//! generation that increments on every successful `lease_pop`; every
//! acknowledgment must present the generation it was leased with, so a node
//! that lost its lease (crash, pause, slow fetch) cannot overwrite the work
//! of the node that took the task over.

mod schema;
mod sqlite;

pub use sqlite::{SqliteCoordinationStore, StoreOptions};

use crate::task::{CanonicalKey, DeadLetterReason, Task};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Failures of the shared store itself (never task-level)
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store could not be reached or a statement failed
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that cannot be valid
    #[error("Coordination store inconsistent: {0}")]
    Inconsistent(String),
}

impl From<rusqlite::Error> for CoordinationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// A time-bounded claim on one task by one node
#[derive(Debug, Clone)]
pub struct Lease {
    pub task: Task,
    /// Node id of the holder
    pub holder: String,
    pub generation: u64,
    pub expires_at: DateTime<Utc>,
}

/// Whether an acknowledgment took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// The lease was superseded (re-leased or already settled); nothing changed
    Stale,
}

/// Result of [`CoordinationStore::push_if_new_at`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Key marked and task inserted
    Pushed,
    /// Another node already holds the key; nothing written
    Duplicate,
    /// Pending tasks are at capacity; the key stays unmarked
    Full,
}

/// Task counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
}

impl QueueCounts {
    /// True when no task is waiting or being worked on
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.leased == 0
    }
}

/// Dedup guarantee a store provides across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// `mark_if_new` is linearizable across all nodes
    Strong,
    /// Two nodes may both see a key as new within `window`
    Eventual { window: Duration },
}

/// Store protocol for the shared work queue
///
/// Methods are blocking; async callers run them on the blocking pool.
/// Every `_at` method takes the current time explicitly so behavior can be
/// replayed deterministically; the unsuffixed methods use the wall clock.
pub trait CoordinationStore: Send + Sync {
    /// Adds a new pending task, due immediately
    fn push_at(&self, task: &Task, now: DateTime<Utc>) -> CoordinationResult<()>;

    /// Marks a key as seen; true if no other node had marked it
    fn mark_if_new_at(&self, key: &CanonicalKey, now: DateTime<Utc>) -> CoordinationResult<bool>;

    /// Marks the task's key and inserts the task in one atomic step
    ///
    /// Either both writes land or neither does, so a failed insert never
    /// leaves a key marked without a task behind it. `capacity` bounds the
    /// number of pending tasks and is checked in the same step.
    fn push_if_new_at(
        &self,
        task: &Task,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> CoordinationResult<PushOutcome>;

    /// Leases the next available task to `node`
    ///
    /// Available means pending and due, or leased with an expired lease.
    fn lease_pop_at(
        &self,
        node: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>>;

    /// Settles a leased task as succeeded
    fn ack_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome>;

    /// Returns a leased task to the queue, due after `delay`
    ///
    /// `task` supplies the new attempt counter and history.
    fn nack_at(
        &self,
        lease: &Lease,
        task: &Task,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome>;

    /// Settles a leased task as dead-lettered
    fn dead_letter_at(
        &self,
        lease: &Lease,
        task: &Task,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome>;

    /// Gives a lease back without consuming an attempt
    fn release_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome>;

    fn counts(&self) -> CoordinationResult<QueueCounts>;

    fn consistency(&self) -> Consistency;

    fn push(&self, task: &Task) -> CoordinationResult<()> {
        self.push_at(task, Utc::now())
    }

    fn mark_if_new(&self, key: &CanonicalKey) -> CoordinationResult<bool> {
        self.mark_if_new_at(key, Utc::now())
    }

    fn push_if_new(&self, task: &Task, capacity: usize) -> CoordinationResult<PushOutcome> {
        self.push_if_new_at(task, capacity, Utc::now())
    }

    fn lease_pop(&self, node: &str, lease_duration: Duration) -> CoordinationResult<Option<Lease>> {
        self.lease_pop_at(node, lease_duration, Utc::now())
    }

    fn ack(&self, lease: &Lease) -> CoordinationResult<AckOutcome> {
        self.ack_at(lease, Utc::now())
    }

    fn nack(&self, lease: &Lease, task: &Task, delay: Duration) -> CoordinationResult<AckOutcome> {
        self.nack_at(lease, task, delay, Utc::now())
    }

    fn dead_letter(
        &self,
        lease: &Lease,
        task: &Task,
        reason: DeadLetterReason,
    ) -> CoordinationResult<AckOutcome> {
        self.dead_letter_at(lease, task, reason, Utc::now())
    }

    fn release(&self, lease: &Lease) -> CoordinationResult<AckOutcome> {
        self.release_at(lease, Utc::now())
    }
}
