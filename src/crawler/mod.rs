//! Crawler module: scheduling, fetching and link extraction
//!
//! This module contains the scheduling core, including:
//! - The bounded local frontier and the shared lease-based queue
//! - Deduplication of canonical targets
//! - Retry classification with exponential backoff
//! - The fixed-size worker pool and its lifecycle
//! - HTTP fetching and HTML link extraction

mod coordinator;
mod dedup;
mod fetcher;
mod frontier;
mod lifecycle;
mod parser;
mod pool;
mod queue;
mod retry;

pub use coordinator::{Coordinator, RunReport, SeedSummary, Services};
pub use dedup::Deduplicator;
pub use fetcher::{build_http_client, FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use frontier::{Dequeued, DropReason, Enqueued, Frontier, RejectReason};
pub use lifecycle::{LifecycleController, LifecycleState, Shutdown, StopHandle};
pub use parser::{extract_links, HtmlLinkExtractor, LinkExtractor};
pub use pool::{PoolContext, PoolOutcome, PoolStats, WorkerPool};
pub use queue::{SharedQueue, WorkQueue};
pub use retry::{RetryDecision, RetryPolicy};

use crate::config::Config;
use crate::SumiError;

/// Runs a complete crawl with the given collaborators
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `services` - Fetcher, extractor, sinks and optional coordination store
///
/// # Returns
///
/// * `Ok(RunReport)` - The run completed or was interrupted
/// * `Err(SumiError)` - Setup failed or the coordination store failed
pub async fn crawl(config: &Config, services: Services) -> Result<RunReport, SumiError> {
    Coordinator::new(config, services)?.run().await
}
