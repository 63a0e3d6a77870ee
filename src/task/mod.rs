//! Task data model
//!
//! A [`Task`] is one unit of fetch work. Its identity (id, canonical key,
//! URL, depth, priority) never changes after creation; only the attempt
//! counter and the failure history grow as the task is retried.

mod state;

pub use state::TaskState;

use crate::crawler::FetchResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

/// Unique identifier of a task, stable across retries and nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Allocates a fresh, globally unique id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id previously produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form of a target, the identity used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Builds the key for an already canonicalized URL
    pub fn from_url(url: &Url) -> Self {
        Self(url.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retryability of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, connection failures, 5xx, 429
    Transient,
    /// Other 4xx, malformed or unsupported responses
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// One failed attempt, kept so dead letters carry their full history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt counter at the time of the failure (0 for the first fetch)
    pub attempt: u32,
    pub class: ErrorClass,
    pub cause: String,
    pub at: DateTime<Utc>,
}

/// A unit of fetch work
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub key: CanonicalKey,
    pub url: Url,
    /// Link distance from the seed that led here (seeds are depth 0)
    pub depth: u32,
    /// Number of retries already scheduled for this task
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Explicit tier; lower values are served first
    pub priority: Option<u32>,
    pub history: Vec<AttemptRecord>,
}

impl Task {
    /// Creates a new task for a canonical URL
    pub fn new(url: Url, depth: u32, priority: Option<u32>) -> Self {
        Self {
            id: TaskId::new(),
            key: CanonicalKey::from_url(&url),
            url,
            depth,
            attempt: 0,
            enqueued_at: Utc::now(),
            priority,
            history: Vec::new(),
        }
    }

    /// Ordering tier: explicit priority if set, otherwise depth
    pub fn tier(&self) -> u32 {
        self.priority.unwrap_or(self.depth)
    }

    /// Appends a failure for the current attempt to the history
    pub fn record_failure(&mut self, class: ErrorClass, cause: impl Into<String>) {
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            class,
            cause: cause.into(),
            at: Utc::now(),
        });
    }
}

/// How a single fetch attempt ended
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(FetchResponse),
    TransientFailure(String),
    PermanentFailure(String),
}

impl Outcome {
    /// Outcome of a failed attempt, by the class of its error
    pub fn failure(class: ErrorClass, cause: impl Into<String>) -> Self {
        match class {
            ErrorClass::Transient => Self::TransientFailure(cause.into()),
            ErrorClass::Permanent => Self::PermanentFailure(cause.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::TransientFailure(_) => "transient",
            Self::PermanentFailure(_) => "permanent",
        }
    }

    /// Failure cause, `None` for a success
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::TransientFailure(cause) | Self::PermanentFailure(cause) => Some(cause),
        }
    }
}

/// A task together with the outcome of its latest attempt
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub outcome: Outcome,
    pub completed_at: DateTime<Utc>,
}

/// Why a task ended in the dead-letter sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// A non-retryable error on any attempt
    Permanent,
    /// Retries exhausted (`max_attempts` reached)
    PoisonTask,
}

impl DeadLetterReason {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::PoisonTask => "poison_task",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "permanent" => Some(Self::Permanent),
            "poison_task" => Some(Self::PoisonTask),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// A task that will never be retried again, with its full retry history
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A task given up on during a forced shutdown
#[derive(Debug, Clone)]
pub struct Abandoned {
    pub task: Task,
    pub abandoned_at: DateTime<Utc>,
}
