//! Run lifecycle: Running, then Draining, then Stopped
//!
//! The controller owns the stop and abort tokens. A stop request closes
//! seed intake and lets queued work finish within the grace period; once
//! the grace period runs out (or a second stop arrives) the abort token
//! fires and in-flight fetches are abandoned.

use crate::crawler::pool::{PoolStats, WorkerPool};
use crate::crawler::queue::WorkQueue;
use crate::storage::RunStatus;
use crate::task::Abandoned;
use crate::Result;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    /// Seed intake closed; queued work, retries and discoveries continue
    Draining,
    /// Every worker has exited
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Cloneable handle for requesting a shutdown, e.g. from a signal handler
#[derive(Clone)]
pub struct StopHandle {
    queue: Arc<WorkQueue>,
    state: Arc<watch::Sender<LifecycleState>>,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl StopHandle {
    /// Requests a graceful stop; a second request aborts in-flight fetches
    pub fn request_stop(&self) {
        if self.stop.is_cancelled() {
            tracing::warn!("Second stop request, abandoning in-flight fetches");
            self.abort.cancel();
            return;
        }

        tracing::info!("Stop requested, draining");
        self.queue.begin_drain();
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        });
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// How a supervised run ended
#[derive(Debug)]
pub struct Shutdown {
    pub status: RunStatus,
    pub stats: PoolStats,
    /// In-flight fetches cancelled by the abort, then queued tasks that never
    /// started (local mode only)
    pub abandoned: Vec<Abandoned>,
}

/// Drives one run from Running to Stopped
pub struct LifecycleController {
    queue: Arc<WorkQueue>,
    state: Arc<watch::Sender<LifecycleState>>,
    stop: CancellationToken,
    abort: CancellationToken,
    grace_period: Duration,
}

impl LifecycleController {
    pub fn new(queue: Arc<WorkQueue>, grace_period: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            queue,
            state: Arc::new(state),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            grace_period,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            queue: Arc::clone(&self.queue),
            state: Arc::clone(&self.state),
            stop: self.stop.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Token handed to the pool; fired on forced shutdown
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Resolves once a stop has been requested
    pub async fn stop_requested(&self) {
        self.stop.cancelled().await
    }

    /// Supervises `pool` until the run ends
    ///
    /// The run ends when the queue goes idle on its own, when a stop request
    /// has drained (or timed out), or when a worker fails on the
    /// coordination store. `Stopped` is published only after the pool has
    /// been joined, including on the error path.
    ///
    /// # Returns
    ///
    /// * `Ok(Shutdown)` - `Completed` for a natural finish, `Interrupted`
    ///   after a stop request
    /// * `Err(SumiError)` - A coordination failure or a worker panic
    pub async fn supervise(&self, pool: WorkerPool) -> Result<Shutdown> {
        let result = self.run_until_done(&pool).await;

        // Whatever happened, nothing may be dequeued from here on
        self.queue.close();
        if result.is_err() {
            self.abort.cancel();
        }

        let joined = pool.join().await;
        let leftovers = self.queue.drain_remaining();
        self.publish(LifecycleState::Stopped);

        let status = result?;
        let mut outcome = joined?;

        if !leftovers.is_empty() {
            tracing::warn!("{} queued task(s) never started", leftovers.len());
            let now = Utc::now();
            outcome
                .abandoned
                .extend(leftovers.into_iter().map(|task| Abandoned {
                    task,
                    abandoned_at: now,
                }));
        }

        tracing::info!("Run {}", status.to_db_string());
        Ok(Shutdown {
            status,
            stats: outcome.stats,
            abandoned: outcome.abandoned,
        })
    }

    /// Tears the pool down after a failure outside the workers
    ///
    /// Used when the run cannot start properly, e.g. seeding hit a store
    /// error. Subscribers still see `Stopped` once every worker has exited.
    pub async fn abort_pool(&self, pool: WorkerPool) {
        self.abort.cancel();
        self.queue.close();
        if let Err(e) = pool.join().await {
            tracing::debug!("Worker pool exited with an error after abort: {}", e);
        }
        self.publish(LifecycleState::Stopped);
    }

    async fn run_until_done(&self, pool: &WorkerPool) -> Result<RunStatus> {
        tokio::select! {
            idle = self.queue.wait_idle() => {
                idle?;
                tracing::info!("Queue is idle, finishing run");
                self.publish(LifecycleState::Draining);
                return Ok(RunStatus::Completed);
            }
            _ = self.stop.cancelled() => {}
            _ = pool.failed() => {
                self.abort.cancel();
                return Ok(RunStatus::Failed);
            }
        }

        // Covers a stop token cancelled without going through the handle
        self.queue.begin_drain();
        self.publish(LifecycleState::Draining);

        tokio::select! {
            idle = self.queue.wait_idle() => {
                idle?;
                tracing::info!("Drained cleanly");
            }
            _ = tokio::time::sleep(self.grace_period) => {
                tracing::warn!(
                    "Grace period of {:?} elapsed, abandoning in-flight fetches",
                    self.grace_period
                );
                self.abort.cancel();
            }
            _ = self.abort.cancelled() => {}
            _ = pool.failed() => {
                self.abort.cancel();
                return Ok(RunStatus::Failed);
            }
        }

        Ok(RunStatus::Interrupted)
    }

    fn publish(&self, next: LifecycleState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!("Lifecycle {} -> {}", state, next);
            *state = next;
            true
        });
    }
}
