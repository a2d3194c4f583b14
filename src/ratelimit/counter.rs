//! Window counter state and the decisions derived from it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

/// Per-identifier counter for the current window.
///
/// Owned by a window store; callers only ever see a [`WindowSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    /// Hits recorded in the current window
    pub count: u64,
    /// When the current window ends
    pub window_reset_at: DateTime<Utc>,
}

impl WindowEntry {
    /// Open a new, empty window starting at `now`.
    pub fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: window_end(now, window),
        }
    }

    /// Whether this window has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.window_reset_at <= now
    }

    /// Record one hit, saturating instead of wrapping.
    pub fn hit(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Copy out the observable state.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: self.count,
            window_reset_at: self.window_reset_at,
        }
    }
}

/// Post-increment view of a window entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u64,
    pub window_reset_at: DateTime<Utc>,
}

/// Compute `now + window`, clamping absurdly large windows instead of overflowing.
pub fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|w| now.checked_add_signed(w))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Maximum requests per window for the tier
    pub limit: u64,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// When the current window ends
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset_at: DateTime<Utc>,
}

impl RateLimitResult {
    /// Derive a decision from a post-increment snapshot.
    pub fn from_snapshot(limit: u64, snapshot: WindowSnapshot) -> Self {
        Self {
            allowed: snapshot.count <= limit,
            limit,
            remaining: limit.saturating_sub(snapshot.count),
            reset_at: snapshot.window_reset_at,
        }
    }

    /// Reset time in epoch seconds, rounded up so clients never retry early.
    pub fn reset_epoch_secs(&self) -> i64 {
        let secs = self.reset_at.timestamp();
        if self.reset_at.timestamp_subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }

    /// Seconds a denied caller should wait, never less than one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        if millis <= 0 {
            return 1;
        }
        let secs = (millis as u64).div_ceil(1000);
        secs.max(1)
    }
}
