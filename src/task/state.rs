/// Task state definitions for the shared work queue
///
/// These are the states a task row moves through in the coordination
/// store. Local runs keep the same lifecycle implicitly in the frontier.
use std::fmt;

/// Represents where a task currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    // ===== Active States =====
    /// Task is queued (possibly with a retry delay) and may be leased
    Pending,

    /// Task is held by a node under a lease
    Leased,

    // ===== Terminal States =====
    /// Task was fetched successfully and acknowledged
    Succeeded,

    /// Task failed permanently or exhausted its retries
    DeadLettered,
}

impl TaskState {
    /// Returns true if this is a terminal state (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    /// Converts the state to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Parses a state from its database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "leased" => Some(Self::Leased),
            "succeeded" => Some(Self::Succeeded),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Returns all possible task states
    pub fn all_states() -> [Self; 4] {
        [
            Self::Pending,
            Self::Leased,
            Self::Succeeded,
            Self::DeadLettered,
        ]
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
