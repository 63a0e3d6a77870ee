//! Crawler coordinator - wires the scheduling pieces into one run
//!
//! The coordinator builds the work queue (local or shared), spawns the
//! worker pool, feeds the seeds and hands supervision over to the
//! lifecycle controller. Every collaborator is chosen at construction time
//! and passed in through [`Services`].

use crate::config::{Config, Ordering, SchedulerConfig};
use crate::coordination::{CoordinationResult, CoordinationStore};
use crate::crawler::fetcher::Fetcher;
use crate::crawler::frontier::{DropReason, Enqueued};
use crate::crawler::lifecycle::{LifecycleController, LifecycleState, StopHandle};
use crate::crawler::parser::{HtmlLinkExtractor, LinkExtractor};
use crate::crawler::pool::{PoolContext, PoolStats, WorkerPool};
use crate::crawler::queue::WorkQueue;
use crate::crawler::retry::RetryPolicy;
use crate::output::{DeadLetterSink, ResultSink};
use crate::storage::RunStatus;
use crate::task::{Abandoned, Task};
use crate::url::{canonicalize, Scope};
use crate::{ConfigError, SumiError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Collaborators of a run
pub struct Services {
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn LinkExtractor>,
    pub results: Arc<dyn ResultSink>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Shared store; required exactly when `[coordination]` is configured
    pub coordination: Option<Arc<dyn CoordinationStore>>,
}

impl Services {
    /// Creates services for a local run with the HTML link extractor
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        results: Arc<dyn ResultSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            fetcher,
            extractor: Arc::new(HtmlLinkExtractor),
            results,
            dead_letters,
            coordination: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_coordination(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.coordination = Some(store);
        self
    }
}

/// Outcome of feeding the seed list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub accepted: usize,
    /// Seeds whose canonical form was already known
    pub duplicates: usize,
    /// Malformed seeds and seeds refused by backpressure or draining
    pub rejected: usize,
}

/// Summary of a finished run
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub elapsed: Duration,
    pub node_id: String,
    pub seeds: SeedSummary,
    pub stats: PoolStats,
    pub abandoned: Vec<Abandoned>,
    /// Highest number of tasks this node had in flight at once
    pub peak_in_flight: usize,
}

/// Main crawler coordinator structure
pub struct Coordinator {
    scheduler: SchedulerConfig,
    scope: Scope,
    seeds: Vec<String>,
    node_id: String,
    queue: Arc<WorkQueue>,
    controller: LifecycleController,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn LinkExtractor>,
    results: Arc<dyn ResultSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `config` - Validated crawler configuration; its `seeds` are queued
    ///   when the run starts
    /// * `services` - Fetcher, link extractor, sinks and, for distributed
    ///   mode, the coordination store
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(SumiError::Config)` - A coordination store was supplied without
    ///   a `[coordination]` section, or the other way around
    pub fn new(config: &Config, services: Services) -> Result<Self, SumiError> {
        let node_id = config
            .coordination
            .as_ref()
            .and_then(|c| c.node_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let queue = match (services.coordination, config.coordination.as_ref()) {
            (Some(store), Some(coordination)) => {
                tracing::info!("Node {} joining shared queue", node_id);
                if config.scheduler.ordering == Ordering::RoundRobin {
                    tracing::warn!(
                        "ordering = \"round-robin\" has no effect on a shared queue; tiers are served strictly"
                    );
                }
                WorkQueue::shared(store, node_id.clone(), &config.scheduler, coordination)
            }
            (None, None) => WorkQueue::local(&config.scheduler),
            (Some(_), None) => {
                return Err(ConfigError::Validation(
                    "A coordination store was supplied but [coordination] is not configured"
                        .to_string(),
                )
                .into())
            }
            (None, Some(_)) => {
                return Err(ConfigError::Validation(
                    "[coordination] is configured but no coordination store was supplied"
                        .to_string(),
                )
                .into())
            }
        };

        let queue = Arc::new(queue);
        let controller =
            LifecycleController::new(Arc::clone(&queue), config.scheduler.grace_period());

        Ok(Self {
            scheduler: config.scheduler.clone(),
            scope: Scope::new(&config.scope.allowed_domains),
            seeds: config.seeds.clone(),
            node_id,
            queue,
            controller,
            fetcher: services.fetcher,
            extractor: services.extractor,
            results: services.results,
            dead_letters: services.dead_letters,
        })
    }

    /// Queues additional seed URLs for the run
    pub fn add_seeds<I, S>(&mut self, seeds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds.extend(seeds.into_iter().map(Into::into));
    }

    /// Handle for stopping the run from outside, e.g. on Ctrl-C
    pub fn stop_handle(&self) -> StopHandle {
        self.controller.stop_handle()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.controller.subscribe()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_distributed(&self) -> bool {
        self.queue.is_shared()
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Runs the crawl to completion
    ///
    /// Workers are spawned first, then the seeds are fed in, then the
    /// lifecycle controller supervises until the queue is idle or a stop
    /// has drained.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The run completed or was interrupted
    /// * `Err(SumiError)` - The coordination store failed or a worker panicked
    pub async fn run(self) -> Result<RunReport, SumiError> {
        let started = Instant::now();
        tracing::info!(
            "Starting run on node {} with {} workers ({} queue)",
            self.node_id,
            self.scheduler.worker_count,
            if self.queue.is_shared() { "shared" } else { "local" }
        );

        let ctx = PoolContext {
            queue: Arc::clone(&self.queue),
            fetcher: Arc::clone(&self.fetcher),
            extractor: Arc::clone(&self.extractor),
            results: Arc::clone(&self.results),
            dead_letters: Arc::clone(&self.dead_letters),
            policy: RetryPolicy::from_config(&self.scheduler),
            scope: self.scope.clone(),
            max_depth: self.scheduler.max_depth,
            fetch_timeout: self.scheduler.fetch_timeout(),
        };
        let pool = WorkerPool::spawn(
            self.scheduler.worker_count as usize,
            ctx,
            self.controller.abort_token(),
        );

        let seeding = tokio::select! {
            summary = self.seed() => summary,
            _ = pool.failed() => Ok(SeedSummary::default()),
        };
        let seeds = match seeding {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Seeding failed: {}", e);
                self.controller.abort_pool(pool).await;
                return Err(e.into());
            }
        };
        tracing::info!(
            "Seeded {} task(s) ({} duplicate, {} rejected)",
            seeds.accepted,
            seeds.duplicates,
            seeds.rejected
        );

        let shutdown = self.controller.supervise(pool).await?;
        let report = RunReport {
            status: shutdown.status,
            elapsed: started.elapsed(),
            node_id: self.node_id.clone(),
            seeds,
            stats: shutdown.stats,
            abandoned: shutdown.abandoned,
            peak_in_flight: self.queue.peak_in_flight(),
        };

        tracing::info!(
            "Run finished in {:.1}s: {} succeeded, {} retried, {} dead-lettered, {} abandoned",
            report.elapsed.as_secs_f64(),
            report.stats.succeeded,
            report.stats.retried,
            report.stats.dead_lettered,
            report.abandoned.len()
        );
        Ok(report)
    }

    async fn seed(&self) -> CoordinationResult<SeedSummary> {
        let mut summary = SeedSummary::default();

        for raw in &self.seeds {
            let url = match canonicalize(raw) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!("Skipping seed {}: {}", raw, e);
                    summary.rejected += 1;
                    continue;
                }
            };

            match self.queue.enqueue(Task::new(url, 0, None)).await? {
                Enqueued::Accepted => summary.accepted += 1,
                Enqueued::Dropped(DropReason::DuplicateKey) => {
                    tracing::debug!("Duplicate seed {}", raw);
                    summary.duplicates += 1;
                }
                Enqueued::Rejected(reason) => {
                    tracing::warn!("Seed {} rejected: {}", raw, reason);
                    summary.rejected += 1;
                }
            }
        }

        Ok(summary)
    }
}
