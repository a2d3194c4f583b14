//! Window store trait for abstracting local and distributed counting.

use async_trait::async_trait;

use super::counter::WindowSnapshot;
use super::rules::RateLimitConfig;

/// Storage for per-identifier window counters.
///
/// Implemented by the in-process [`LocalStore`](super::LocalStore) and the
/// Redis-backed [`DistributedStore`](super::DistributedStore), so the
/// limiter works with either.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record one hit for `identifier` in its current window and return the
    /// post-increment state.
    ///
    /// Concurrent calls for the same identifier are linearized, so no hit
    /// that fits the quota is lost or counted twice. The local store returns
    /// N distinct counts for N calls. The Redis sliding window does not store
    /// a hit once the window is full: accepted hits see `1..=limit` and every
    /// denied hit sees `limit + 1`.
    async fn increment(&self, identifier: &str, config: &RateLimitConfig) -> WindowSnapshot;

    /// Current state without recording a hit. `None` if no live window exists.
    async fn peek(&self, identifier: &str, config: &RateLimitConfig) -> Option<WindowSnapshot>;

    /// Forget all state for `identifier`.
    async fn reset(&self, identifier: &str);
}
