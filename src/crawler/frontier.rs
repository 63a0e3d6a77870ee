//! Local frontier: the bounded, tiered queue of pending fetch work
//!
//! The frontier owns the [`Deduplicator`] so that the capacity check, the
//! dedup mark and the insertion happen under one short-held lock. Waiters
//! (dequeuers, blocked enqueuers, idle watchers) park on `tokio::sync::Notify`
//! and never hold the lock across an await point.

use crate::config::{Backpressure, Ordering as TierOrdering, SchedulerConfig};
use crate::crawler::dedup::Deduplicator;
use crate::task::{Task, TaskId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of offering a new task to the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    Rejected(RejectReason),
    Dropped(DropReason),
}

/// Why a task was refused; its key is left unmarked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The frontier is at capacity and the caller may not wait
    BackpressureFull,
    /// Seed intake is closed
    Draining,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackpressureFull => write!(f, "queue is full"),
            Self::Draining => write!(f, "intake is closed"),
        }
    }
}

/// Why a task was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The canonical key was already seen
    DuplicateKey,
}

/// Result of waiting for work
#[derive(Debug)]
pub enum Dequeued {
    Task(Task),
    /// The frontier was closed or the wait was cancelled
    Closed,
}

/// Which intake path a task came through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intake {
    /// Seeds: refused while draining, may block on a full frontier
    Seed,
    /// Discoveries: accepted while draining, never block
    Discovery,
}

enum Admission {
    Done(Enqueued),
    Full(Task),
}

enum Take {
    Task(Task),
    Closed,
    Wait(Option<Instant>),
}

/// A retry waiting for its backoff to elapse
#[derive(Debug)]
struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

// Reversed so the earliest due time sits on top of the max-heap
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

#[derive(Debug, Default)]
struct State {
    /// Ready tasks by tier; a tier is removed once empty
    tiers: BTreeMap<u32, VecDeque<Task>>,
    ready: usize,
    delayed: BinaryHeap<DelayedTask>,
    seq: u64,
    in_flight: HashSet<TaskId>,
    peak_in_flight: usize,
    /// Last tier served, for round-robin
    cursor: Option<u32>,
    draining: bool,
    closed: bool,
}

impl State {
    fn push_ready(&mut self, task: Task) {
        self.tiers.entry(task.tier()).or_default().push_back(task);
        self.ready += 1;
    }

    /// Moves every retry whose backoff has elapsed into its tier
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.push_ready(delayed.task);
            }
        }
    }

    fn next_tier(&self, ordering: TierOrdering) -> Option<u32> {
        let first = self.tiers.keys().next().copied();
        match (ordering, self.cursor) {
            (TierOrdering::RoundRobin, Some(last)) => self
                .tiers
                .range((Bound::Excluded(last), Bound::Unbounded))
                .next()
                .map(|(tier, _)| *tier)
                .or(first),
            _ => first,
        }
    }

    fn pop_ready(&mut self, ordering: TierOrdering) -> Option<Task> {
        let tier = self.next_tier(ordering)?;
        let queue = self.tiers.get_mut(&tier)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.tiers.remove(&tier);
        }
        if task.is_some() {
            self.ready -= 1;
            self.cursor = Some(tier);
        }
        task
    }

    fn is_idle(&self) -> bool {
        self.ready == 0 && self.delayed.is_empty() && self.in_flight.is_empty()
    }
}

/// Bounded priority queue of fetch tasks for a single process
#[derive(Debug)]
pub struct Frontier {
    state: Mutex<State>,
    dedup: Deduplicator,
    capacity: usize,
    backpressure: Backpressure,
    ordering: TierOrdering,
    /// Wakes dequeuers: new ready work, an earlier retry, or closure
    work: Notify,
    /// Wakes blocked seeders: a slot freed, draining began, or closure
    space: Notify,
    /// Wakes idle watchers
    idle: Notify,
}

impl Frontier {
    /// Creates an empty frontier
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of ready (not yet started) tasks
    /// * `backpressure` - Whether `enqueue` waits or rejects when full
    /// * `ordering` - How tiers are served
    /// * `dedup` - Deduplicator consulted for every new task
    pub fn new(
        capacity: usize,
        backpressure: Backpressure,
        ordering: TierOrdering,
        dedup: Deduplicator,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dedup,
            capacity,
            backpressure,
            ordering,
            work: Notify::new(),
            space: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.frontier_capacity,
            config.backpressure,
            config.ordering,
            Deduplicator::with_ttl(config.dedup_ttl()),
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a new seed task
    ///
    /// With the `block` policy this waits for a free slot; with `reject` a
    /// full frontier returns `Rejected(BackpressureFull)`. Once draining has
    /// begun every seed is refused with `Rejected(Draining)`.
    pub async fn enqueue(&self, task: Task) -> Enqueued {
        let mut task = task;
        loop {
            let space = self.space.notified();
            match self.admit(task, Intake::Seed) {
                Admission::Done(result) => return result,
                Admission::Full(t) if self.backpressure == Backpressure::Block => task = t,
                Admission::Full(_) => return Enqueued::Rejected(RejectReason::BackpressureFull),
            }
            space.await;
        }
    }

    /// Admits a discovered task without ever waiting
    ///
    /// Workers use this for extracted links: a worker blocking on its own
    /// queue would stall the pool, so a full frontier always rejects.
    pub fn offer(&self, task: Task) -> Enqueued {
        match self.admit(task, Intake::Discovery) {
            Admission::Done(result) => result,
            Admission::Full(_) => Enqueued::Rejected(RejectReason::BackpressureFull),
        }
    }

    fn admit(&self, task: Task, intake: Intake) -> Admission {
        let mut state = self.lock();

        if state.closed || (intake == Intake::Seed && state.draining) {
            return Admission::Done(Enqueued::Rejected(RejectReason::Draining));
        }

        if self.dedup.contains(&task.key) {
            return Admission::Done(Enqueued::Dropped(DropReason::DuplicateKey));
        }

        if state.ready >= self.capacity {
            return Admission::Full(task);
        }

        if !self.dedup.mark_if_new(&task.key) {
            return Admission::Done(Enqueued::Dropped(DropReason::DuplicateKey));
        }

        state.push_ready(task);
        drop(state);
        self.work.notify_waiters();
        Admission::Done(Enqueued::Accepted)
    }

    /// Schedules another attempt of an in-flight task after `delay`
    ///
    /// Retries reuse the task's identity, so they bypass the deduplicator
    /// and the capacity bound. The task's in-flight slot is released.
    pub fn requeue(&self, task: Task, delay: Duration) {
        let mut state = self.lock();
        state.in_flight.remove(&task.id);
        state.seq += 1;
        let seq = state.seq;
        state.delayed.push(DelayedTask {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.work.notify_waiters();
    }

    /// Waits for the next task
    ///
    /// Resolves with a task once one is ready (including a retry whose
    /// backoff has elapsed), or with `Closed` when the frontier is closed or
    /// `cancel` fires. The returned task counts as in flight until it is
    /// passed to [`Frontier::complete`] or [`Frontier::requeue`].
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Dequeued {
        loop {
            if cancel.is_cancelled() {
                return Dequeued::Closed;
            }

            let work = self.work.notified();
            let next_due = match self.take() {
                Take::Task(task) => return Dequeued::Task(task),
                Take::Closed => return Dequeued::Closed,
                Take::Wait(next_due) => next_due,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Dequeued::Closed,
                _ = work => {}
                _ = sleep_until(next_due) => {}
            }
        }
    }

    fn take(&self) -> Take {
        let mut state = self.lock();
        if state.closed {
            return Take::Closed;
        }

        state.promote_due(Instant::now());

        match state.pop_ready(self.ordering) {
            Some(task) => {
                state.in_flight.insert(task.id);
                state.peak_in_flight = state.peak_in_flight.max(state.in_flight.len());
                drop(state);
                self.space.notify_waiters();
                Take::Task(task)
            }
            None => Take::Wait(state.delayed.peek().map(|d| d.due)),
        }
    }

    /// Releases the in-flight slot of a finished task
    pub fn complete(&self, id: TaskId) {
        let mut state = self.lock();
        state.in_flight.remove(&id);
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once nothing is ready, delayed or in flight
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.lock().is_idle() {
                return;
            }
            idle.await;
        }
    }

    /// Stops seed intake; retries and discoveries are still admitted
    pub fn begin_drain(&self) {
        self.lock().draining = true;
        self.space.notify_waiters();
    }

    /// Refuses all further intake and wakes every waiter with `Closed`
    pub fn close(&self) {
        let mut state = self.lock();
        state.draining = true;
        state.closed = true;
        drop(state);
        self.work.notify_waiters();
        self.space.notify_waiters();
    }

    /// Removes and returns every task that never started (ready or delayed)
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut state = self.lock();
        let mut remaining: Vec<Task> = std::mem::take(&mut state.tiers)
            .into_values()
            .flatten()
            .collect();
        remaining.extend(
            std::mem::take(&mut state.delayed)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|d| d.task),
        );
        state.ready = 0;
        remaining
    }

    /// Number of ready tasks
    pub fn len(&self) -> usize {
        self.lock().ready
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of retries waiting for their backoff
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Highest in-flight count observed so far
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
