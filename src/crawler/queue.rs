//! The work queue the pool pulls from: a local frontier or a shared store
//!
//! The variant is chosen once, when the coordinator is built. Both variants
//! expose the same per-task routing (`succeed`, `retry`, `dead_letter`,
//! `abandon`) so the worker loop never branches on the mode.

use crate::config::{Backpressure, CoordinationConfig, SchedulerConfig};
use crate::coordination::{
    AckOutcome, CoordinationError, CoordinationResult, CoordinationStore, Lease, PushOutcome,
};
use crate::crawler::frontier::{Dequeued, DropReason, Enqueued, Frontier, RejectReason};
use crate::task::{DeadLetterReason, Task, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of fetch work for the worker pool
pub enum WorkQueue {
    /// Single process, in-memory frontier
    Local(Frontier),
    /// Several processes sharing one coordination store
    Shared(SharedQueue),
}

impl WorkQueue {
    pub fn local(config: &SchedulerConfig) -> Self {
        Self::Local(Frontier::from_config(config))
    }

    pub fn shared(
        store: Arc<dyn CoordinationStore>,
        node_id: impl Into<String>,
        scheduler: &SchedulerConfig,
        coordination: &CoordinationConfig,
    ) -> Self {
        Self::Shared(SharedQueue::new(
            store,
            node_id,
            scheduler.frontier_capacity,
            scheduler.backpressure,
            coordination.lease_duration(),
            coordination.poll_interval(),
        ))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Admits a seed task (may wait under the `block` policy)
    pub async fn enqueue(&self, task: Task) -> CoordinationResult<Enqueued> {
        match self {
            Self::Local(frontier) => Ok(frontier.enqueue(task).await),
            Self::Shared(shared) => shared.enqueue(task, true).await,
        }
    }

    /// Admits a discovered task without waiting for space
    pub async fn offer(&self, task: Task) -> CoordinationResult<Enqueued> {
        match self {
            Self::Local(frontier) => Ok(frontier.offer(task)),
            Self::Shared(shared) => shared.enqueue(task, false).await,
        }
    }

    /// Waits for the next task, closure or cancellation
    pub async fn dequeue(&self, cancel: &CancellationToken) -> CoordinationResult<Dequeued> {
        match self {
            Self::Local(frontier) => Ok(frontier.dequeue(cancel).await),
            Self::Shared(shared) => shared.dequeue(cancel).await,
        }
    }

    /// Settles a task whose fetch succeeded
    pub async fn succeed(&self, task: &Task) -> CoordinationResult<AckOutcome> {
        match self {
            Self::Local(frontier) => {
                frontier.complete(task.id);
                Ok(AckOutcome::Acknowledged)
            }
            Self::Shared(shared) => shared.ack(task).await,
        }
    }

    /// Schedules another attempt after `delay`
    pub async fn retry(&self, task: Task, delay: Duration) -> CoordinationResult<AckOutcome> {
        match self {
            Self::Local(frontier) => {
                frontier.requeue(task, delay);
                Ok(AckOutcome::Acknowledged)
            }
            Self::Shared(shared) => shared.nack(task, delay).await,
        }
    }

    /// Settles a task that will never be retried
    pub async fn dead_letter(
        &self,
        task: &Task,
        reason: DeadLetterReason,
    ) -> CoordinationResult<AckOutcome> {
        match self {
            Self::Local(frontier) => {
                frontier.complete(task.id);
                Ok(AckOutcome::Acknowledged)
            }
            Self::Shared(shared) => shared.dead_letter(task, reason).await,
        }
    }

    /// Gives up an in-flight task during a forced shutdown
    ///
    /// In shared mode the lease is released so another node can pick the
    /// task up without waiting for the lease to expire.
    pub async fn abandon(&self, task: &Task) -> CoordinationResult<()> {
        match self {
            Self::Local(frontier) => {
                frontier.complete(task.id);
                Ok(())
            }
            Self::Shared(shared) => shared.release(task).await.map(|_| ()),
        }
    }

    /// Resolves once no work is queued, scheduled for retry or in flight
    ///
    /// In shared mode this covers every node using the store.
    pub async fn wait_idle(&self) -> CoordinationResult<()> {
        match self {
            Self::Local(frontier) => {
                frontier.wait_idle().await;
                Ok(())
            }
            Self::Shared(shared) => shared.wait_idle().await,
        }
    }

    /// Stops seed intake
    pub fn begin_drain(&self) {
        match self {
            Self::Local(frontier) => frontier.begin_drain(),
            Self::Shared(shared) => shared.begin_drain(),
        }
    }

    /// Wakes every waiting worker with `Closed`
    pub fn close(&self) {
        match self {
            Self::Local(frontier) => frontier.close(),
            Self::Shared(shared) => shared.close(),
        }
    }

    /// Tasks that never started; always empty in shared mode, where they
    /// stay in the store for the other nodes
    pub fn drain_remaining(&self) -> Vec<Task> {
        match self {
            Self::Local(frontier) => frontier.drain_remaining(),
            Self::Shared(_) => Vec::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        match self {
            Self::Local(frontier) => frontier.in_flight(),
            Self::Shared(shared) => shared.in_flight(),
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        match self {
            Self::Local(frontier) => frontier.peak_in_flight(),
            Self::Shared(shared) => shared.peak_in_flight(),
        }
    }
}

/// Node-side view of the shared store: leases held by this process
pub struct SharedQueue {
    store: Arc<dyn CoordinationStore>,
    node_id: String,
    capacity: usize,
    backpressure: Backpressure,
    lease_duration: Duration,
    poll_interval: Duration,
    leases: Mutex<HashMap<TaskId, Lease>>,
    peak_in_flight: AtomicUsize,
    draining: AtomicBool,
    closed: CancellationToken,
}

impl SharedQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        node_id: impl Into<String>,
        capacity: usize,
        backpressure: Backpressure,
        lease_duration: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            capacity,
            backpressure,
            lease_duration,
            poll_interval,
            leases: Mutex::new(HashMap::new()),
            peak_in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<TaskId, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a store operation on the blocking pool
    async fn call<T, F>(&self, op: F) -> CoordinationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CoordinationStore) -> CoordinationResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| CoordinationError::Unavailable(format!("store call failed: {}", e)))?
    }

    async fn enqueue(&self, task: Task, seed: bool) -> CoordinationResult<Enqueued> {
        let task = Arc::new(task);
        loop {
            if self.closed.is_cancelled() || (seed && self.draining.load(Ordering::SeqCst)) {
                return Ok(Enqueued::Rejected(RejectReason::Draining));
            }

            let pushed = {
                let task = Arc::clone(&task);
                let capacity = self.capacity;
                self.call(move |store| store.push_if_new(&task, capacity))
                    .await?
            };
            match pushed {
                PushOutcome::Pushed => return Ok(Enqueued::Accepted),
                PushOutcome::Duplicate => return Ok(Enqueued::Dropped(DropReason::DuplicateKey)),
                PushOutcome::Full => {}
            }

            if !seed || self.backpressure == Backpressure::Reject {
                return Ok(Enqueued::Rejected(RejectReason::BackpressureFull));
            }

            tokio::select! {
                _ = self.closed.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> CoordinationResult<Dequeued> {
        loop {
            if self.closed.is_cancelled() || cancel.is_cancelled() {
                return Ok(Dequeued::Closed);
            }

            let node = self.node_id.clone();
            let lease_duration = self.lease_duration;
            let lease = self
                .call(move |store| store.lease_pop(&node, lease_duration))
                .await?;

            if let Some(lease) = lease {
                let task = lease.task.clone();
                let mut leases = self.leases();
                leases.insert(task.id, lease);
                self.peak_in_flight.fetch_max(leases.len(), Ordering::SeqCst);
                return Ok(Dequeued::Task(task));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Dequeued::Closed),
                _ = self.closed.cancelled() => return Ok(Dequeued::Closed),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn take_lease(&self, id: TaskId) -> CoordinationResult<Lease> {
        self.leases().remove(&id).ok_or_else(|| {
            CoordinationError::Inconsistent(format!("no lease held for task {}", id))
        })
    }

    fn log_stale(&self, action: &str, outcome: AckOutcome, task: &Task) {
        if outcome == AckOutcome::Stale {
            warn!(
                "Lease on {} was taken over by another node; {} ignored",
                task.url, action
            );
        }
    }

    async fn ack(&self, task: &Task) -> CoordinationResult<AckOutcome> {
        let lease = self.take_lease(task.id)?;
        let outcome = self.call(move |store| store.ack(&lease)).await?;
        self.log_stale("ack", outcome, task);
        Ok(outcome)
    }

    async fn nack(&self, task: Task, delay: Duration) -> CoordinationResult<AckOutcome> {
        let lease = self.take_lease(task.id)?;
        let url = task.url.clone();
        let outcome = self
            .call(move |store| store.nack(&lease, &task, delay))
            .await?;
        if outcome == AckOutcome::Stale {
            warn!(
                "Lease on {} was taken over by another node; retry ignored",
                url
            );
        }
        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        task: &Task,
        reason: DeadLetterReason,
    ) -> CoordinationResult<AckOutcome> {
        let lease = self.take_lease(task.id)?;
        let settled = task.clone();
        let outcome = self
            .call(move |store| store.dead_letter(&lease, &settled, reason))
            .await?;
        self.log_stale("dead letter", outcome, task);
        Ok(outcome)
    }

    async fn release(&self, task: &Task) -> CoordinationResult<AckOutcome> {
        let lease = self.take_lease(task.id)?;
        let outcome = self.call(move |store| store.release(&lease)).await?;
        debug!("Released lease on {} ({:?})", task.url, outcome);
        Ok(outcome)
    }

    async fn wait_idle(&self) -> CoordinationResult<()> {
        loop {
            let counts = self.call(|store| store.counts()).await?;
            if counts.is_settled() && self.leases().is_empty() {
                return Ok(());
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn in_flight(&self) -> usize {
        self.leases().len()
    }

    fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}
