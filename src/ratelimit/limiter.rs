//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::WindowStore;
use super::counter::{window_end, RateLimitResult, WindowSnapshot};
use super::local::LocalStore;
use super::rules::RateLimitConfig;

/// Turns window counts into allow/deny decisions.
///
/// Holds no state of its own; all counting goes through the injected
/// [`WindowStore`], so independent limiters can share or isolate stores.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    /// Create a limiter over the given store.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Create a limiter with a private in-process store.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalStore::new()))
    }

    /// Count one request for `identifier` and decide whether it may proceed.
    pub async fn check(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let snapshot = self.store.increment(identifier, config).await;
        let result = RateLimitResult::from_snapshot(config.max_requests(), snapshot);

        trace!(
            identifier = %identifier,
            count = snapshot.count,
            limit = result.limit,
            remaining = result.remaining,
            "Checked rate limit"
        );
        if !result.allowed {
            debug!(
                identifier = %identifier,
                count = snapshot.count,
                limit = result.limit,
                "Rate limit exceeded"
            );
        }

        result
    }

    /// Report the current quota for `identifier` without consuming any.
    ///
    /// With no live window this is the state a first request would start from.
    pub async fn status(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let snapshot = self
            .store
            .peek(identifier, config)
            .await
            .unwrap_or_else(|| WindowSnapshot {
                count: 0,
                window_reset_at: window_end(chrono::Utc::now(), config.window()),
            });

        let limit = config.max_requests();
        RateLimitResult {
            allowed: snapshot.count < limit,
            limit,
            remaining: limit.saturating_sub(snapshot.count),
            reset_at: snapshot.window_reset_at,
        }
    }

    /// Forget all state for `identifier`; its next request starts a new window.
    pub async fn reset(&self, identifier: &str) {
        debug!(identifier = %identifier, "Resetting rate limit state");
        self.store.reset(identifier).await;
    }

    /// The store this limiter counts against.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }
}
