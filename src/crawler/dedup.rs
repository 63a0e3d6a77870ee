//! Deduplication of discovered targets
//!
//! Keys are canonical URLs (see [`crate::url::canonicalize`]). Marking is
//! atomic per key, so among any number of concurrent callers offering the
//! same key exactly one is told it is new.

use crate::task::CanonicalKey;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

/// Concurrent set of seen canonical keys
#[derive(Debug, Default)]
pub struct Deduplicator {
    /// Key -> first-seen timestamp (refreshed when an expired record is reused)
    seen: DashMap<CanonicalKey, DateTime<Utc>>,
    ttl: Option<Duration>,
}

impl Deduplicator {
    /// Creates a deduplicator whose records never expire
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a deduplicator whose records expire after `ttl`
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Marks `key` as seen and returns true if it was not seen before
    pub fn mark_if_new(&self, key: &CanonicalKey) -> bool {
        self.mark_if_new_at(key, Utc::now())
    }

    /// Same as [`Deduplicator::mark_if_new`], with an explicit clock
    ///
    /// An expired record counts as absent; it is refreshed while the shard
    /// lock is held so only one caller can win the reuse.
    pub fn mark_if_new_at(&self, key: &CanonicalKey, now: DateTime<Utc>) -> bool {
        match self.seen.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if self.is_expired(*slot.get(), now) {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Returns true if `key` is currently marked (and not expired)
    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.seen
            .get(key)
            .is_some_and(|first_seen| !self.is_expired(*first_seen, Utc::now()))
    }

    /// Number of stored records, expired ones included
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn is_expired(&self, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.ttl {
            // A first-seen time in the future (clock step) never counts as expired
            Some(ttl) => (now - first_seen).to_std().is_ok_and(|age| age >= ttl),
            None => false,
        }
    }
}
