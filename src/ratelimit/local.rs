//! In-process fixed-window store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::WindowStore;
use super::counter::{WindowEntry, WindowSnapshot};
use super::rules::RateLimitConfig;

/// Fixed-window counters held in a sharded map.
///
/// Each identifier's read-modify-write runs under its shard's write lock,
/// so increments for one identifier are linearized while unrelated
/// identifiers mostly land on other shards. No I/O happens under a lock.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, WindowEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit and return the post-increment snapshot.
    ///
    /// An expired entry is replaced, not merged: the triggering hit is the
    /// first count of the new window.
    pub fn hit(&self, identifier: &str, window: Duration) -> WindowSnapshot {
        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert_with(|| WindowEntry::open(Utc::now(), window));

        // Read the clock under the lock so reset times never go backwards.
        let now = Utc::now();
        if entry.is_expired(now) {
            debug!(identifier = %identifier, "Opening new rate limit window");
            *entry = WindowEntry::open(now, window);
        }
        entry.hit();

        trace!(
            identifier = %identifier,
            count = entry.count,
            "Local window incremented"
        );
        entry.snapshot()
    }

    /// Live snapshot for `identifier`, if any.
    pub fn snapshot(&self, identifier: &str) -> Option<WindowSnapshot> {
        let now = Utc::now();
        self.entries
            .get(identifier)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.snapshot())
    }

    /// Drop the entry for `identifier`.
    pub fn remove(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Evict every entry whose window ended before now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Evict every entry whose window ended at or before `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Number of tracked identifiers, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn increment(&self, identifier: &str, config: &RateLimitConfig) -> WindowSnapshot {
        self.hit(identifier, config.window())
    }

    async fn peek(&self, identifier: &str, _config: &RateLimitConfig) -> Option<WindowSnapshot> {
        self.snapshot(identifier)
    }

    async fn reset(&self, identifier: &str) {
        self.remove(identifier);
    }
}
