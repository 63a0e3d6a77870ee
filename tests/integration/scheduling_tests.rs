//! Integration tests for scheduling behavior in a single process
//!
//! These tests drive full runs through the `Coordinator` with scripted
//! fetchers and an in-memory sink. Timing-sensitive tests run on a paused
//! tokio clock so backoff delays are exact.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sumi_frontier::config::{
    Backpressure, Config, Ordering, OutputConfig, SchedulerConfig, ScopeConfig, UserAgentConfig,
};
use sumi_frontier::crawler::{
    Coordinator, Enqueued, FetchError, FetchResponse, Fetcher, LifecycleState, RejectReason,
    Services,
};
use sumi_frontier::output::MemorySink;
use sumi_frontier::storage::RunStatus;
use sumi_frontier::task::{DeadLetterReason, ErrorClass, Outcome, Task};
use tokio::time::Instant;

fn create_test_config(worker_count: u32, max_attempts: u32, seeds: Vec<&str>) -> Config {
    Config {
        scheduler: SchedulerConfig {
            worker_count,
            max_attempts,
            base_backoff_ms: 1000,
            max_backoff_ms: 4000,
            jitter: 0.0,
            frontier_capacity: 100,
            backpressure: Backpressure::Block,
            ordering: Ordering::Strict,
            fetch_timeout_ms: 30_000,
            grace_period_ms: 10_000,
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
        coordination: None,
        scope: ScopeConfig::default(),
        seeds: seeds.into_iter().map(String::from).collect(),
    }
}

fn page(task: &Task) -> FetchResponse {
    FetchResponse {
        final_url: task.url.clone(),
        status_code: 200,
        content_type: Some("text/html".to_string()),
        body: "<html><body>ok</body></html>".to_string(),
    }
}

/// Fails every fetch with a timeout and records when each attempt started
#[derive(Default)]
struct AlwaysTimeoutFetcher {
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Fetcher for AlwaysTimeoutFetcher {
    async fn fetch(&self, _task: &Task, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(FetchError::Timeout)
    }
}

/// Returns scripted errors per path, then succeeds
#[derive(Default)]
struct ScriptedFetcher {
    failures: Mutex<HashMap<String, Vec<FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn fail(self, path: &str, errors: Vec<FetchError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(path.to_string(), errors);
        self
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, task: &Task, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let mut failures = self.failures.lock().unwrap();
        if let Some(errors) = failures.get_mut(task.url.path()) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        Ok(page(task))
    }
}

/// Sleeps for a fixed time per fetch and tracks concurrency
struct SlowFetcher {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowFetcher {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, task: &Task, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        let now_active = self.active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, AtomicOrdering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, AtomicOrdering::SeqCst);
        self.completed.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(page(task))
    }
}

fn services(fetcher: Arc<dyn Fetcher>, sink: &Arc<MemorySink>) -> Services {
    Services::new(fetcher, sink.clone(), sink.clone())
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_poison_dead_letter() {
    let config = create_test_config(2, 3, vec!["https://example.com/flaky"]);
    let fetcher = Arc::new(AlwaysTimeoutFetcher::default());
    let sink = Arc::new(MemorySink::new());

    let coordinator = Coordinator::new(&config, services(fetcher.clone(), &sink)).unwrap();
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.retried, 3);
    assert_eq!(report.stats.dead_lettered, 1);

    let attempts = fetcher.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1, 2, 4]) {
        let expected = Duration::from_secs(expected);
        assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
        assert!(
            *gap < expected + Duration::from_millis(50),
            "gap {:?} longer than {:?}",
            gap,
            expected
        );
    }

    let dead_letters = sink.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].reason, DeadLetterReason::PoisonTask);
    assert_eq!(dead_letters[0].task.attempt, 3);
    assert_eq!(dead_letters[0].task.history.len(), 4);
    assert!(dead_letters[0]
        .task
        .history
        .iter()
        .all(|h| h.class == ErrorClass::Transient));

    // Every failed attempt is persisted as a result of its own
    let results = sink.results();
    assert_eq!(results.len(), 4);
    assert!(results
        .iter()
        .all(|r| matches!(r.outcome, Outcome::TransientFailure(_))));
    let attempts: Vec<u32> = results.iter().map(|r| r.task.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_seeds_differing_by_fragment_are_deduplicated() {
    let config = create_test_config(
        2,
        3,
        vec![
            "https://example.com/page#one",
            "https://example.com/page#two",
            "https://example.com/page",
            "HTTPS://EXAMPLE.COM/page#three",
            "https://example.com:443/page#four",
        ],
    );
    let fetcher = Arc::new(ScriptedFetcher::default());
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(fetcher.clone(), &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.seeds.accepted, 1);
    assert_eq!(report.seeds.duplicates, 4);
    assert_eq!(fetcher.calls.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(sink.results().len(), 1);
}

#[tokio::test]
async fn test_invalid_seed_is_rejected_not_fatal() {
    let config = create_test_config(
        1,
        3,
        vec!["ftp://example.com/file", "https://example.com/"],
    );
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(Arc::new(ScriptedFetcher::default()), &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.seeds.accepted, 1);
    assert_eq!(report.seeds.rejected, 1);
    assert_eq!(report.stats.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_worker_count() {
    let seeds: Vec<String> = (0..20)
        .map(|i| format!("https://example.com/page/{}", i))
        .collect();
    let mut config = create_test_config(3, 3, vec![]);
    config.seeds = seeds;

    let fetcher = Arc::new(SlowFetcher::new(Duration::from_millis(50)));
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(fetcher.clone(), &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.stats.succeeded, 20);
    assert!(fetcher.max_active.load(AtomicOrdering::SeqCst) <= 3);
    assert!(report.peak_in_flight <= 3);
    assert!(report.peak_in_flight >= 1);
}

#[tokio::test]
async fn test_permanent_error_dead_letters_without_retry() {
    let config = create_test_config(2, 3, vec!["https://example.com/missing"]);
    let fetcher =
        Arc::new(ScriptedFetcher::default().fail("/missing", vec![FetchError::Status(404)]));
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(fetcher.clone(), &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(fetcher.calls.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(report.stats.retried, 0);
    assert_eq!(report.stats.dead_lettered, 1);

    let dead_letters = sink.dead_letters();
    assert_eq!(dead_letters[0].reason, DeadLetterReason::Permanent);
    assert_eq!(dead_letters[0].task.attempt, 0);
    assert_eq!(dead_letters[0].task.history[0].class, ErrorClass::Permanent);

    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].outcome, Outcome::PermanentFailure(_)));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover() {
    let config = create_test_config(2, 3, vec!["https://example.com/busy"]);
    let fetcher = Arc::new(ScriptedFetcher::default().fail(
        "/busy",
        vec![FetchError::Status(503), FetchError::Status(429)],
    ));
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(fetcher.clone(), &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.stats.retried, 2);
    assert_eq!(report.stats.succeeded, 1);
    assert!(sink.dead_letters().is_empty());

    let results = sink.results();
    assert_eq!(results.len(), 3);
    assert!(matches!(&results[0].outcome, Outcome::TransientFailure(c) if c.contains("503")));
    assert!(matches!(&results[1].outcome, Outcome::TransientFailure(c) if c.contains("429")));
    assert!(results[2].outcome.is_success());
    assert_eq!(results[2].task.attempt, 2);
    assert_eq!(results[2].task.history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drain_finishes_queued_work_and_refuses_new_seeds() {
    let config = create_test_config(
        2,
        3,
        vec![
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/3",
            "https://example.com/4",
        ],
    );
    let fetcher = Arc::new(SlowFetcher::new(Duration::from_secs(2)));
    let sink = Arc::new(MemorySink::new());

    let coordinator = Coordinator::new(&config, services(fetcher.clone(), &sink)).unwrap();
    let stop = coordinator.stop_handle();
    let queue = Arc::clone(coordinator.queue());
    let mut states = coordinator.subscribe();

    let observer = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            let mut seen = vec![*states.borrow_and_update()];
            while *seen.last().unwrap() != LifecycleState::Stopped {
                states.changed().await.unwrap();
                seen.push(*states.borrow_and_update());
            }
            // Published only after every worker has exited
            (seen, fetcher.active.load(AtomicOrdering::SeqCst))
        })
    };

    let run = tokio::spawn(coordinator.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.request_stop();

    let late_seed = Task::new(url::Url::parse("https://example.com/late").unwrap(), 0, None);
    assert_eq!(
        queue.enqueue(late_seed).await.unwrap(),
        Enqueued::Rejected(RejectReason::Draining)
    );

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.stats.succeeded, 4);
    assert!(report.abandoned.is_empty());

    let (seen, active_at_stop) = observer.await.unwrap();
    assert_eq!(
        seen,
        vec![
            LifecycleState::Running,
            LifecycleState::Draining,
            LifecycleState::Stopped
        ]
    );
    assert_eq!(active_at_stop, 0);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_abandons_in_flight_and_queued() {
    let mut config = create_test_config(
        2,
        3,
        vec![
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ],
    );
    config.scheduler.grace_period_ms = 1000;
    config.scheduler.fetch_timeout_ms = 600_000;

    let fetcher = Arc::new(SlowFetcher::new(Duration::from_secs(60)));
    let sink = Arc::new(MemorySink::new());

    let coordinator = Coordinator::new(&config, services(fetcher.clone(), &sink)).unwrap();
    let stop = coordinator.stop_handle();
    let run = tokio::spawn(coordinator.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped_at = Instant::now();
    stop.request_stop();

    let report = run.await.unwrap().unwrap();
    assert!(stopped_at.elapsed() >= Duration::from_secs(1));
    assert!(stopped_at.elapsed() < Duration::from_secs(60));

    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.stats.succeeded, 0);
    assert_eq!(report.stats.abandoned, 2);
    assert_eq!(report.abandoned.len(), 3);
    assert!(sink.results().is_empty());
    assert_eq!(fetcher.completed.load(AtomicOrdering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_stop_request_aborts_immediately() {
    let mut config = create_test_config(1, 3, vec!["https://example.com/slow"]);
    config.scheduler.fetch_timeout_ms = 600_000;
    config.scheduler.grace_period_ms = 300_000;

    let fetcher = Arc::new(SlowFetcher::new(Duration::from_secs(120)));
    let sink = Arc::new(MemorySink::new());

    let coordinator = Coordinator::new(&config, services(fetcher, &sink)).unwrap();
    let stop = coordinator.stop_handle();
    let run = tokio::spawn(coordinator.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped_at = Instant::now();
    stop.request_stop();
    stop.request_stop();

    let report = run.await.unwrap().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(report.abandoned.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_is_enforced_by_the_pool() {
    let mut config = create_test_config(1, 1, vec!["https://example.com/hang"]);
    config.scheduler.fetch_timeout_ms = 500;

    let fetcher = Arc::new(SlowFetcher::new(Duration::from_secs(3600)));
    let sink = Arc::new(MemorySink::new());

    let report = Coordinator::new(&config, services(fetcher, &sink))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.stats.retried, 1);
    assert_eq!(report.stats.dead_lettered, 1);
    let dead_letters = sink.dead_letters();
    assert_eq!(dead_letters[0].reason, DeadLetterReason::PoisonTask);
    assert!(dead_letters[0].task.history[0].cause.contains("timed out"));
}
