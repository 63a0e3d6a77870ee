//! Integration tests for distributed mode
//!
//! Every test opens one SQLite coordination file through several store
//! handles, each standing in for a separate crawler process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sumi_frontier::config::{
    Backpressure, Config, CoordinationConfig, Ordering, OutputConfig, SchedulerConfig,
    ScopeConfig, UserAgentConfig,
};
use sumi_frontier::coordination::{
    AckOutcome, Consistency, CoordinationError, CoordinationResult, CoordinationStore, Lease,
    PushOutcome, QueueCounts, SqliteCoordinationStore, StoreOptions,
};
use sumi_frontier::crawler::{
    Coordinator, Dequeued, Enqueued, FetchError, FetchResponse, Fetcher, LifecycleState,
    Services, WorkQueue,
};
use sumi_frontier::output::MemorySink;
use sumi_frontier::storage::RunStatus;
use sumi_frontier::task::{CanonicalKey, DeadLetterReason, Task};
use sumi_frontier::SumiError;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

fn create_test_config(db_path: &Path, node_id: &str, seeds: &[String]) -> Config {
    Config {
        scheduler: SchedulerConfig {
            worker_count: 2,
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 200,
            jitter: 0.0,
            frontier_capacity: 1000,
            backpressure: Backpressure::Block,
            ordering: Ordering::Strict,
            fetch_timeout_ms: 2000,
            grace_period_ms: 5000,
            max_depth: 0,
            dedup_ttl_secs: None,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        output: OutputConfig {
            database_path: ":memory:".to_string(),
        },
        coordination: Some(CoordinationConfig {
            database_path: db_path.display().to_string(),
            lease_duration_ms: 5000,
            poll_interval_ms: 20,
            clock_skew_tolerance_ms: 0,
            node_id: Some(node_id.to_string()),
        }),
        scope: ScopeConfig::default(),
        seeds: seeds.to_vec(),
    }
}

fn open_store(path: &Path) -> Arc<SqliteCoordinationStore> {
    Arc::new(SqliteCoordinationStore::open(path, StoreOptions::default()).unwrap())
}

fn task(path: &str) -> Task {
    Task::new(
        Url::parse(&format!("https://example.com{}", path)).unwrap(),
        0,
        None,
    )
}

/// Succeeds after a short pause and counts fetches per URL
#[derive(Default)]
struct CountingFetcher {
    fetched: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, task: &Task, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        *self
            .fetched
            .lock()
            .unwrap()
            .entry(task.url.to_string())
            .or_insert(0) += 1;
        Ok(FetchResponse {
            final_url: task.url.clone(),
            status_code: 200,
            content_type: Some("text/html".to_string()),
            body: "<html></html>".to_string(),
        })
    }
}

/// Shared store whose writes or leases can be made to fail
struct FlakyStore {
    inner: SqliteCoordinationStore,
    failing_pushes: AtomicUsize,
    failing_leases: AtomicBool,
}

impl FlakyStore {
    fn open(path: &Path) -> Self {
        Self {
            inner: SqliteCoordinationStore::open(path, StoreOptions::default()).unwrap(),
            failing_pushes: AtomicUsize::new(0),
            failing_leases: AtomicBool::new(false),
        }
    }

    /// Fails the next `n` inserts
    fn fail_pushes(self, n: usize) -> Self {
        self.failing_pushes.store(n, AtomicOrdering::SeqCst);
        self
    }

    fn fail_leases(self) -> Self {
        self.failing_leases.store(true, AtomicOrdering::SeqCst);
        self
    }

    fn push_fails(&self) -> bool {
        self.failing_pushes
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

fn unavailable<T>() -> CoordinationResult<T> {
    Err(CoordinationError::Unavailable("disk I/O error".to_string()))
}

impl CoordinationStore for FlakyStore {
    fn push_at(&self, task: &Task, now: DateTime<Utc>) -> CoordinationResult<()> {
        if self.push_fails() {
            return unavailable();
        }
        self.inner.push_at(task, now)
    }

    fn mark_if_new_at(&self, key: &CanonicalKey, now: DateTime<Utc>) -> CoordinationResult<bool> {
        self.inner.mark_if_new_at(key, now)
    }

    fn push_if_new_at(
        &self,
        task: &Task,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> CoordinationResult<PushOutcome> {
        if self.push_fails() {
            return unavailable();
        }
        self.inner.push_if_new_at(task, capacity, now)
    }

    fn lease_pop_at(
        &self,
        node: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        if self.failing_leases.load(AtomicOrdering::SeqCst) {
            return unavailable();
        }
        self.inner.lease_pop_at(node, lease_duration, now)
    }

    fn ack_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome> {
        self.inner.ack_at(lease, now)
    }

    fn nack_at(
        &self,
        lease: &Lease,
        task: &Task,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome> {
        self.inner.nack_at(lease, task, delay, now)
    }

    fn dead_letter_at(
        &self,
        lease: &Lease,
        task: &Task,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> CoordinationResult<AckOutcome> {
        self.inner.dead_letter_at(lease, task, reason, now)
    }

    fn release_at(&self, lease: &Lease, now: DateTime<Utc>) -> CoordinationResult<AckOutcome> {
        self.inner.release_at(lease, now)
    }

    fn counts(&self) -> CoordinationResult<QueueCounts> {
        self.inner.counts()
    }

    fn consistency(&self) -> Consistency {
        self.inner.consistency()
    }
}

#[test]
fn test_lease_takeover_makes_late_ack_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let node_a = open_store(&path);
    let node_b = open_store(&path);
    let lease_duration = Duration::from_secs(2);
    let t0 = Utc::now();

    let t = task("/contested");
    assert!(node_a.mark_if_new_at(&t.key, t0).unwrap());
    node_a.push_at(&t, t0).unwrap();

    // Node A leases the task and then goes silent
    let lease_a = node_a
        .lease_pop_at("node-a", lease_duration, t0)
        .unwrap()
        .unwrap();

    // Still leased at 1.9s, so B gets nothing
    assert!(node_b
        .lease_pop_at("node-b", lease_duration, t0 + chrono::Duration::milliseconds(1900))
        .unwrap()
        .is_none());

    let lease_b = node_b
        .lease_pop_at("node-b", lease_duration, t0 + chrono::Duration::milliseconds(2100))
        .unwrap()
        .unwrap();
    assert_eq!(lease_b.task.id, lease_a.task.id);
    assert!(lease_b.generation > lease_a.generation);

    // A comes back at 2.5s: its ack must not settle B's lease
    assert_eq!(
        node_a
            .ack_at(&lease_a, t0 + chrono::Duration::milliseconds(2500))
            .unwrap(),
        AckOutcome::Stale
    );
    let counts = node_b.counts().unwrap();
    assert_eq!(counts.leased, 1);
    assert_eq!(counts.succeeded, 0);

    assert_eq!(
        node_b
            .ack_at(&lease_b, t0 + chrono::Duration::milliseconds(2600))
            .unwrap(),
        AckOutcome::Acknowledged
    );
    assert_eq!(node_a.counts().unwrap().succeeded, 1);
}

#[test]
fn test_dedup_is_shared_between_nodes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let node_a = open_store(&path);
    let node_b = open_store(&path);

    let t = task("/page");
    assert!(node_a.mark_if_new(&t.key).unwrap());
    assert!(!node_b.mark_if_new(&t.key).unwrap());
    assert!(!node_a.mark_if_new(&t.key).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_fetch_every_task_exactly_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let seeds: Vec<String> = (0..12)
        .map(|i| format!("https://example.com/item/{}", i))
        .collect();

    let fetcher_a = Arc::new(CountingFetcher::default());
    let fetcher_b = Arc::new(CountingFetcher::default());
    let sink = Arc::new(MemorySink::new());

    let node_a = Coordinator::new(
        &create_test_config(&path, "node-a", &seeds),
        Services::new(fetcher_a.clone(), sink.clone(), sink.clone())
            .with_coordination(open_store(&path)),
    )
    .unwrap();
    let node_b = Coordinator::new(
        &create_test_config(&path, "node-b", &seeds),
        Services::new(fetcher_b.clone(), sink.clone(), sink.clone())
            .with_coordination(open_store(&path)),
    )
    .unwrap();
    assert!(node_a.is_distributed());
    assert_eq!(node_b.node_id(), "node-b");

    let (report_a, report_b) = tokio::join!(node_a.run(), node_b.run());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    assert_eq!(report_a.status, RunStatus::Completed);
    assert_eq!(report_b.status, RunStatus::Completed);
    assert_eq!(report_a.seeds.accepted + report_b.seeds.accepted, 12);
    assert_eq!(report_a.seeds.duplicates + report_b.seeds.duplicates, 12);
    assert_eq!(report_a.stats.succeeded + report_b.stats.succeeded, 12);

    let mut fetched = fetcher_a.fetched.lock().unwrap().clone();
    for (url, count) in fetcher_b.fetched.lock().unwrap().iter() {
        *fetched.entry(url.clone()).or_insert(0) += count;
    }
    assert_eq!(fetched.len(), 12);
    assert!(fetched.values().all(|&count| count == 1));
    assert_eq!(sink.results().len(), 12);

    let counts = open_store(&path).counts().unwrap();
    assert!(counts.is_settled());
    assert_eq!(counts.succeeded, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_surviving_node_recovers_task_of_dead_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");

    // A node that leases a task and never reports back
    let dead_node = open_store(&path);
    let orphan = task("/orphan");
    assert!(dead_node.mark_if_new(&orphan.key).unwrap());
    dead_node.push(&orphan).unwrap();
    let stale_lease = dead_node
        .lease_pop("node-dead", Duration::from_millis(200))
        .unwrap()
        .unwrap();

    let fetcher = Arc::new(CountingFetcher::default());
    let sink = Arc::new(MemorySink::new());
    let survivor = Coordinator::new(
        &create_test_config(&path, "node-b", &[]),
        Services::new(fetcher.clone(), sink.clone(), sink.clone())
            .with_coordination(open_store(&path)),
    )
    .unwrap();

    let report = survivor.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(
        fetcher.fetched.lock().unwrap().get("https://example.com/orphan"),
        Some(&1)
    );

    assert_eq!(dead_node.ack(&stale_lease).unwrap(), AckOutcome::Stale);
    assert_eq!(dead_node.counts().unwrap().succeeded, 1);
}

#[test]
fn test_store_without_coordination_section_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let mut config = create_test_config(&path, "node-a", &[]);
    config.coordination = None;

    let sink = Arc::new(MemorySink::new());
    let result = Coordinator::new(
        &config,
        Services::new(Arc::new(CountingFetcher::default()), sink.clone(), sink)
            .with_coordination(open_store(&path)),
    );

    assert!(matches!(result, Err(SumiError::Config(_))));
}

#[test]
fn test_coordination_section_without_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir.path().join("shared.db"), "node-a", &[]);

    let sink = Arc::new(MemorySink::new());
    let result = Coordinator::new(
        &config,
        Services::new(Arc::new(CountingFetcher::default()), sink.clone(), sink),
    );

    assert!(matches!(result, Err(SumiError::Config(_))));
}

#[tokio::test]
async fn test_failed_insert_does_not_lose_the_target() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let store = Arc::new(FlakyStore::open(&path).fail_pushes(1));
    let config = create_test_config(&path, "node-a", &[]);
    let queue = WorkQueue::shared(
        store.clone(),
        "node-a",
        &config.scheduler,
        config.coordination.as_ref().unwrap(),
    );

    assert!(matches!(
        queue.enqueue(task("/flaky")).await,
        Err(CoordinationError::Unavailable(_))
    ));

    // Once the store recovers the same URL is still admissible
    assert_eq!(queue.enqueue(task("/flaky")).await.unwrap(), Enqueued::Accepted);
    assert_eq!(store.counts().unwrap().pending, 1);

    let Dequeued::Task(leased) = queue.dequeue(&CancellationToken::new()).await.unwrap() else {
        panic!("expected the task to be leasable");
    };
    assert_eq!(leased.url.path(), "/flaky");
}

#[tokio::test]
async fn test_lease_failure_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let seeds = vec!["https://example.com/a".to_string()];

    let sink = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        &create_test_config(&path, "node-a", &seeds),
        Services::new(Arc::new(CountingFetcher::default()), sink.clone(), sink.clone())
            .with_coordination(Arc::new(FlakyStore::open(&path).fail_leases())),
    )
    .unwrap();
    let states = coordinator.subscribe();

    let result = tokio::time::timeout(Duration::from_secs(10), coordinator.run())
        .await
        .expect("run should stop on a store error");

    assert!(matches!(
        result,
        Err(SumiError::Coordination(CoordinationError::Unavailable(_)))
    ));
    assert_eq!(*states.borrow(), LifecycleState::Stopped);
    assert!(sink.results().is_empty());
}

#[tokio::test]
async fn test_seeding_failure_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let seeds = vec!["https://example.com/a".to_string()];

    let fetcher = Arc::new(CountingFetcher::default());
    let sink = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        &create_test_config(&path, "node-a", &seeds),
        Services::new(fetcher.clone(), sink.clone(), sink)
            .with_coordination(Arc::new(FlakyStore::open(&path).fail_pushes(usize::MAX))),
    )
    .unwrap();
    let states = coordinator.subscribe();

    let result = tokio::time::timeout(Duration::from_secs(10), coordinator.run())
        .await
        .expect("run should stop when seeding fails");

    assert!(matches!(result, Err(SumiError::Coordination(_))));
    assert_eq!(*states.borrow(), LifecycleState::Stopped);
    assert!(fetcher.fetched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_queue_serves_tiers_strictly_under_round_robin() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let mut config = create_test_config(&path, "node-a", &[]);
    config.scheduler.ordering = Ordering::RoundRobin;

    let sink = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        &config,
        Services::new(Arc::new(CountingFetcher::default()), sink.clone(), sink)
            .with_coordination(open_store(&path)),
    )
    .unwrap();
    let queue = coordinator.queue();

    let mut deep = task("/deep");
    deep.depth = 3;
    for t in [deep, task("/a"), task("/b")] {
        assert_eq!(queue.offer(t).await.unwrap(), Enqueued::Accepted);
    }

    let cancel = CancellationToken::new();
    let mut order = Vec::new();
    for _ in 0..3 {
        let Dequeued::Task(t) = queue.dequeue(&cancel).await.unwrap() else {
            panic!("expected a task");
        };
        order.push(t.url.path().to_string());
    }
    // Same-tier tasks may tie on enqueue time; the deep one is always last
    assert_eq!(order[2], "/deep");
    order.truncate(2);
    order.sort();
    assert_eq!(order, vec!["/a", "/b"]);
}
