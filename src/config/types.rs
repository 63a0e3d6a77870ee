use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Sumi-Frontier
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    /// Present only when several processes share one work queue
    #[serde(default)]
    pub coordination: Option<CoordinationConfig>,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub seeds: Vec<String>,
}

/// What `enqueue` does when the frontier is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Wait for a free slot
    #[default]
    Block,
    /// Return `Rejected(BackpressureFull)` immediately
    Reject,
}

/// How the frontier picks between priority tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ordering {
    /// Always serve the lowest non-empty tier first
    #[default]
    Strict,
    /// Rotate across non-empty tiers
    ///
    /// Local frontier only. A shared coordination store always leases the
    /// lowest tier first.
    RoundRobin,
}

/// Scheduling behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent workers (fixed for the lifetime of a run)
    #[serde(rename = "worker-count")]
    pub worker_count: u32,

    /// Attempts after which a task is dead-lettered as a poison task
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-backoff-ms")]
    pub base_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,

    /// Random spread applied to each backoff delay, as a fraction (0.0 to 0.5)
    #[serde(default)]
    pub jitter: f64,

    /// Maximum number of queued (not yet started) tasks
    #[serde(rename = "frontier-capacity")]
    pub frontier_capacity: usize,

    #[serde(default)]
    pub backpressure: Backpressure,

    #[serde(default)]
    pub ordering: Ordering,

    #[serde(rename = "fetch-timeout-ms")]
    pub fetch_timeout_ms: u64,

    /// How long a drain may wait for in-flight work before aborting it
    #[serde(rename = "grace-period-ms")]
    pub grace_period_ms: u64,

    /// Maximum link depth from a seed; discoveries beyond it are not queued
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Optional lifetime of a dedup record
    #[serde(rename = "dedup-ttl-secs", default)]
    pub dedup_ttl_secs: Option<u64>,
}

impl SchedulerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn dedup_ttl(&self) -> Option<Duration> {
        self.dedup_ttl_secs.map(Duration::from_secs)
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the User-Agent header value
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database holding results and dead letters
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Shared work queue configuration (distributed mode)
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Path to the SQLite file every node opens
    #[serde(rename = "database-path")]
    pub database_path: String,

    #[serde(rename = "lease-duration-ms")]
    pub lease_duration_ms: u64,

    /// How often an idle worker polls the shared store for work
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Extra time an expired lease must age before another node may take it
    #[serde(rename = "clock-skew-tolerance-ms", default)]
    pub clock_skew_tolerance_ms: u64,

    /// Identity of this node in lease records; a v4 UUID when unset
    #[serde(rename = "node-id", default)]
    pub node_id: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl CoordinationConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_tolerance_ms)
    }
}

/// Which hosts discovered links may point at
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeConfig {
    /// Domain patterns (e.g., "example.com" or "*.example.com"); empty allows all
    #[serde(rename = "allowed-domains", default)]
    pub allowed_domains: Vec<String>,
}
