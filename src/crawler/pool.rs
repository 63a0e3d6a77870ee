//! Worker pool: a fixed set of tokio tasks draining the work queue
//!
//! Each worker loops: dequeue, fetch under a timeout, then route the task
//! by outcome. Success feeds extracted links back into the queue and the
//! result to the result sink. Failure goes through the retry policy and is
//! either requeued with a backoff or dead-lettered. A worker holds at most
//! one task at a time, so at most `size` tasks are ever in flight.

use crate::coordination::{AckOutcome, CoordinationResult};
use crate::crawler::fetcher::{FetchError, FetchResponse, Fetcher};
use crate::crawler::frontier::{Dequeued, DropReason, Enqueued, RejectReason};
use crate::crawler::parser::LinkExtractor;
use crate::crawler::queue::WorkQueue;
use crate::crawler::retry::{RetryDecision, RetryPolicy};
use crate::output::{DeadLetterSink, ResultSink};
use crate::task::{Abandoned, DeadLetter, Outcome, Task, TaskResult};
use crate::url::{canonicalize, Scope};
use crate::SumiError;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Log a progress line every this many successful fetches
const PROGRESS_INTERVAL: u64 = 10;

/// Counters of what the pool did, as a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
    /// Discovered links accepted into the queue
    pub discovered: u64,
    /// Discovered links dropped as already seen
    pub duplicates: u64,
    pub out_of_scope: u64,
    /// Discovered links refused because the queue was full or closed
    pub rejected_discoveries: u64,
    /// Acknowledgments ignored because another node took the task over
    pub stale_leases: u64,
    pub sink_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    discovered: AtomicU64,
    duplicates: AtomicU64,
    out_of_scope: AtomicU64,
    rejected_discoveries: AtomicU64,
    stale_leases: AtomicU64,
    sink_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStats {
            succeeded: get(&self.succeeded),
            retried: get(&self.retried),
            dead_lettered: get(&self.dead_lettered),
            abandoned: get(&self.abandoned),
            discovered: get(&self.discovered),
            duplicates: get(&self.duplicates),
            out_of_scope: get(&self.out_of_scope),
            rejected_discoveries: get(&self.rejected_discoveries),
            stale_leases: get(&self.stale_leases),
            sink_errors: get(&self.sink_errors),
        }
    }
}

/// Everything a worker needs, shared by all workers of a pool
pub struct PoolContext {
    pub queue: Arc<WorkQueue>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn LinkExtractor>,
    pub results: Arc<dyn ResultSink>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub policy: RetryPolicy,
    pub scope: Scope,
    /// Links found on pages at this depth are not followed
    pub max_depth: u32,
    pub fetch_timeout: Duration,
}

struct Shared {
    ctx: PoolContext,
    counters: Counters,
    abandoned: Mutex<Vec<Abandoned>>,
    /// Cancelled when a worker hits a coordination failure
    failed: CancellationToken,
}

/// Fixed-size set of workers
pub struct WorkerPool {
    workers: JoinSet<CoordinationResult<()>>,
    shared: Arc<Shared>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers on the current runtime
    ///
    /// # Arguments
    ///
    /// * `size` - Number of workers; fixed for the lifetime of the pool
    /// * `ctx` - Queue, collaborators and per-task settings
    /// * `abort` - Fired on forced shutdown; in-flight fetches are cancelled
    ///   and their tasks reported as abandoned
    pub fn spawn(size: usize, ctx: PoolContext, abort: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            counters: Counters::default(),
            abandoned: Mutex::new(Vec::new()),
            failed: CancellationToken::new(),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..size {
            let shared = Arc::clone(&shared);
            let abort = abort.clone();
            workers.spawn(async move {
                let result = run_worker(worker_id, &shared, &abort).await;
                if let Err(e) = &result {
                    tracing::error!("Worker {} stopped on coordination failure: {}", worker_id, e);
                    shared.failed.cancel();
                }
                result
            });
        }

        tracing::debug!("Spawned {} workers", size);
        Self {
            workers,
            shared,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot()
    }

    /// Resolves when any worker has stopped on a coordination failure
    pub async fn failed(&self) {
        self.shared.failed.cancelled().await
    }

    /// Waits for every worker to exit
    ///
    /// # Returns
    ///
    /// * `Ok(PoolOutcome)` - Final counters and tasks abandoned mid-fetch
    /// * `Err(SumiError::Coordination)` - The first coordination failure
    /// * `Err(SumiError::WorkerPanic)` - A worker panicked
    pub async fn join(mut self) -> Result<PoolOutcome, SumiError> {
        let mut first_error: Option<SumiError> = None;

        while let Some(joined) = self.workers.join_next().await {
            let error = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(SumiError::Coordination(e)),
                Err(e) => Some(SumiError::WorkerPanic(e.to_string())),
            };
            if first_error.is_none() {
                first_error = error;
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let abandoned = std::mem::take(
            &mut *self
                .shared
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        Ok(PoolOutcome {
            stats: self.shared.counters.snapshot(),
            abandoned,
        })
    }
}

/// What a pool leaves behind once joined
#[derive(Debug)]
pub struct PoolOutcome {
    pub stats: PoolStats,
    pub abandoned: Vec<Abandoned>,
}

async fn run_worker(
    worker_id: usize,
    shared: &Shared,
    abort: &CancellationToken,
) -> CoordinationResult<()> {
    loop {
        let task = match shared.ctx.queue.dequeue(abort).await? {
            Dequeued::Task(task) => task,
            Dequeued::Closed => break,
        };

        tracing::debug!(
            "Worker {} fetching {} (attempt {})",
            worker_id,
            task.url,
            task.attempt
        );
        process(shared, task, abort).await?;
    }

    tracing::debug!("Worker {} exiting", worker_id);
    Ok(())
}

async fn process(shared: &Shared, task: Task, abort: &CancellationToken) -> CoordinationResult<()> {
    let ctx = &shared.ctx;
    let fetched = tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        result = tokio::time::timeout(ctx.fetch_timeout, ctx.fetcher.fetch(&task, ctx.fetch_timeout)) => {
            Some(result.unwrap_or(Err(FetchError::Timeout)))
        }
    };

    match fetched {
        None => abandon(shared, task).await,
        Some(Ok(response)) => on_success(shared, task, response).await,
        Some(Err(error)) => on_failure(shared, task, error).await,
    }
}

async fn abandon(shared: &Shared, task: Task) -> CoordinationResult<()> {
    tracing::warn!("Abandoning in-flight fetch of {}", task.url);
    shared.ctx.queue.abandon(&task).await?;
    bump(&shared.counters.abandoned);
    shared
        .abandoned
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Abandoned {
            task,
            abandoned_at: Utc::now(),
        });
    Ok(())
}

async fn on_success(shared: &Shared, task: Task, response: FetchResponse) -> CoordinationResult<()> {
    let ctx = &shared.ctx;

    // Discoveries go in before the task settles so the queue is never
    // observed idle while links are still being offered
    if task.depth < ctx.max_depth {
        for link in ctx.extractor.extract(&task, &response) {
            offer_link(shared, &task, &link).await?;
        }
    }

    if ctx.queue.succeed(&task).await? == AckOutcome::Stale {
        bump(&shared.counters.stale_leases);
        return Ok(());
    }

    let succeeded = bump(&shared.counters.succeeded);
    tracing::debug!("Fetched {} ({})", task.url, response.status_code);
    if succeeded % PROGRESS_INTERVAL == 0 {
        tracing::info!(
            "Progress: {} fetched, {} in flight",
            succeeded,
            ctx.queue.in_flight()
        );
    }

    persist(shared, task, Outcome::Success(response));
    Ok(())
}

fn persist(shared: &Shared, task: Task, outcome: Outcome) {
    let result = TaskResult {
        task,
        outcome,
        completed_at: Utc::now(),
    };
    if let Err(e) = shared.ctx.results.persist(&result) {
        tracing::error!("Failed to persist result for {}: {}", result.task.url, e);
        bump(&shared.counters.sink_errors);
    }
}

async fn offer_link(shared: &Shared, parent: &Task, link: &str) -> CoordinationResult<()> {
    let counters = &shared.counters;

    let url = match canonicalize(link) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!("Skipping link {} on {}: {}", link, parent.url, e);
            return Ok(());
        }
    };

    if !shared.ctx.scope.allows(&url) {
        bump(&counters.out_of_scope);
        return Ok(());
    }

    let child = Task::new(url, parent.depth + 1, None);
    match shared.ctx.queue.offer(child).await? {
        Enqueued::Accepted => bump(&counters.discovered),
        Enqueued::Dropped(DropReason::DuplicateKey) => bump(&counters.duplicates),
        Enqueued::Rejected(reason) => {
            if reason == RejectReason::BackpressureFull {
                tracing::warn!("Queue full, dropping discovered link {}", link);
            }
            bump(&counters.rejected_discoveries)
        }
    };

    Ok(())
}

async fn on_failure(shared: &Shared, mut task: Task, error: FetchError) -> CoordinationResult<()> {
    let ctx = &shared.ctx;
    let class = error.class();
    task.record_failure(class, error.to_string());
    // The attempt as it failed, before the counter moves on
    let attempt = task.clone();

    match ctx.policy.decide(task.attempt, class) {
        RetryDecision::RetryAfter(backoff) => {
            let delay = ctx.policy.jittered(backoff, &mut rand::thread_rng());
            tracing::warn!(
                "Fetch of {} failed ({}), retrying in {:?} (attempt {})",
                task.url,
                error,
                delay,
                task.attempt + 1
            );
            task.attempt += 1;
            if ctx.queue.retry(task, delay).await? == AckOutcome::Stale {
                bump(&shared.counters.stale_leases);
                return Ok(());
            }
            bump(&shared.counters.retried);
        }
        RetryDecision::DeadLetter(reason) => {
            if ctx.queue.dead_letter(&task, reason).await? == AckOutcome::Stale {
                bump(&shared.counters.stale_leases);
                return Ok(());
            }

            tracing::warn!(
                "Dead-lettering {} ({}) after {} attempt(s): {}",
                task.url,
                reason,
                task.attempt,
                error
            );
            bump(&shared.counters.dead_lettered);

            let dead_letter = DeadLetter {
                task,
                reason,
                dead_lettered_at: Utc::now(),
            };
            if let Err(e) = ctx.dead_letters.record(&dead_letter) {
                tracing::error!(
                    "Failed to record dead letter for {}: {}",
                    dead_letter.task.url,
                    e
                );
                bump(&shared.counters.sink_errors);
            }
        }
    }

    persist(shared, attempt, Outcome::failure(class, error.to_string()));
    Ok(())
}
