//! Distributed window store backed by Redis.
//!
//! Redis keeps a true sliding window per identifier (a sorted set of hit
//! timestamps), while the local fallback keeps a fixed window. The two are
//! not numerically equivalent: a burst straddling a window boundary can get
//! up to twice the quota through the fixed window, but not through the
//! sliding one. Deployments without Redis are therefore slightly more
//! permissive at boundaries.
//!
//! Any Redis failure or timeout falls back to the local store for that one
//! call. Availability of the protected service wins over exact counting.
//!
//! While Redis is down, a new connection is attempted at most once per
//! [`RECONNECT_BACKOFF`]. Calls in between fail immediately and count
//! locally, so an outage adds at most one `timeout` of latency per back-off
//! period instead of one per request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, Script};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::backend::WindowStore;
use super::counter::{window_end, WindowSnapshot};
use super::local::LocalStore;
use super::rules::RateLimitConfig;
use crate::error::{QuotaError, Result};

/// Minimum gap between connection attempts to Redis.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Longest window sent to Redis, about 100 years. Keeps PEXPIRE in range.
const MAX_WINDOW_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Drop stale hits, admit this hit if there is room, report the count
/// including this hit and the oldest live timestamp. Rejected hits are not
/// stored, so hammering a full window does not extend it.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, member)
end

local oldest_score = now
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end

redis.call('PEXPIRE', key, window)
return {count + 1, oldest_score}
"#;

/// Read-only count of live hits and the oldest live timestamp.
const PEEK_SCRIPT: &str = r#"
local key = KEYS[1]
local min_exclusive = ARGV[1]

local live = redis.call('ZCOUNT', key, min_exclusive, '+inf')
if live == 0 then
  return {0, 0}
end
local oldest = redis.call('ZRANGEBYSCORE', key, min_exclusive, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
return {live, tonumber(oldest[2])}
"#;

/// Connection settings for the distributed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Redis URL, e.g. `rediss://host:6379`
    pub url: String,
    /// Access token, sent as the connection password
    pub token: Option<String>,
    /// Prefix for every key written
    pub key_prefix: String,
    /// Upper bound on each call
    pub timeout: Duration,
}

/// Which store the limiter counts against. Chosen once at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// In-process counters only
    Local,
    /// Redis, with the local store as per-call fallback
    Distributed(DistributedConfig),
}

impl Backend {
    /// Build the window store for this backend on top of `local`.
    ///
    /// Redis is not contacted here; an unreachable server only shows up as
    /// per-call fallbacks.
    pub fn into_store(self, local: Arc<LocalStore>) -> Result<Arc<dyn WindowStore>> {
        match self {
            Backend::Local => {
                info!("Using local window store");
                let store: Arc<dyn WindowStore> = local;
                Ok(store)
            }
            Backend::Distributed(config) => {
                let remote = RedisWindow::new(&config)?;
                info!(
                    key_prefix = %config.key_prefix,
                    timeout = ?config.timeout,
                    "Using distributed window store with local fallback"
                );
                Ok(Arc::new(DistributedStore::new(
                    Arc::new(remote),
                    local,
                    config.timeout,
                )))
            }
        }
    }
}

/// A shared, fallible window backend.
#[async_trait]
pub trait RemoteWindow: Send + Sync {
    async fn increment(&self, identifier: &str, config: &RateLimitConfig) -> Result<WindowSnapshot>;

    async fn peek(&self, identifier: &str, config: &RateLimitConfig)
        -> Result<Option<WindowSnapshot>>;

    async fn reset(&self, identifier: &str) -> Result<()>;
}

enum ConnectionState {
    Idle,
    /// Last connection attempt started at this instant and has not succeeded
    Attempted(Instant),
    Ready(ConnectionManager),
}

/// Sliding window counters in Redis sorted sets.
pub struct RedisWindow {
    client: redis::Client,
    key_prefix: String,
    /// Lazily established, reused across calls
    connection: Mutex<ConnectionState>,
    increment_script: Script,
    peek_script: Script,
}

impl std::fmt::Debug for RedisWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindow")
            .field("addr", &self.client.get_connection_info().addr)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisWindow {
    /// Parse the connection settings. Fails only on a malformed URL.
    pub fn new(config: &DistributedConfig) -> Result<Self> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(token) = &config.token {
            info.redis.password = Some(token.clone());
        }
        let client = redis::Client::open(info)?;

        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            connection: Mutex::new(ConnectionState::Idle),
            increment_script: Script::new(INCREMENT_SCRIPT),
            peek_script: Script::new(PEEK_SCRIPT),
        })
    }

    /// The Redis key holding `identifier`'s window.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        {
            let mut state = self.connection.lock();
            let may_connect = match &*state {
                ConnectionState::Ready(conn) => return Ok(conn.clone()),
                ConnectionState::Attempted(at) => at.elapsed() >= RECONNECT_BACKOFF,
                ConnectionState::Idle => true,
            };
            if !may_connect {
                return Err(QuotaError::Backend(
                    "distributed store unavailable, waiting to reconnect".to_string(),
                ));
            }
            *state = ConnectionState::Attempted(Instant::now());
        }

        // A cancelled or failed attempt leaves the state at `Attempted`.
        debug!("Connecting to distributed store");
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *self.connection.lock() = ConnectionState::Ready(conn.clone());
        info!("Connected to distributed store");
        Ok(conn)
    }
}

fn window_millis(config: &RateLimitConfig) -> i64 {
    i64::try_from(config.window().as_millis())
        .unwrap_or(i64::MAX)
        .clamp(1, MAX_WINDOW_MS)
}

fn reset_time(oldest_ms: i64, window_ms: i64, config: &RateLimitConfig) -> DateTime<Utc> {
    oldest_ms
        .checked_add(window_ms)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(|| window_end(Utc::now(), config.window()))
}

#[async_trait]
impl RemoteWindow for RedisWindow {
    async fn increment(&self, identifier: &str, config: &RateLimitConfig) -> Result<WindowSnapshot> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window_millis(config);

        let (count, oldest_ms): (u64, i64) = self
            .increment_script
            .key(self.key(identifier))
            .arg(now_ms)
            .arg(window_ms)
            .arg(config.max_requests())
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;

        trace!(identifier = %identifier, count = count, "Distributed window incremented");

        Ok(WindowSnapshot {
            count,
            window_reset_at: reset_time(oldest_ms, window_ms, config),
        })
    }

    async fn peek(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<Option<WindowSnapshot>> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window_millis(config);

        let (count, oldest_ms): (u64, i64) = self
            .peek_script
            .key(self.key(identifier))
            .arg(format!("({}", now_ms - window_ms))
            .invoke_async(&mut conn)
            .await?;

        if count == 0 {
            return Ok(None);
        }
        Ok(Some(WindowSnapshot {
            count,
            window_reset_at: reset_time(oldest_ms, window_ms, config),
        }))
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _removed: i64 = redis::cmd("DEL")
            .arg(self.key(identifier))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Remote window store that fails open to a local store.
pub struct DistributedStore {
    remote: Arc<dyn RemoteWindow>,
    local: Arc<LocalStore>,
    timeout: Duration,
}

impl DistributedStore {
    pub fn new(remote: Arc<dyn RemoteWindow>, local: Arc<LocalStore>, timeout: Duration) -> Self {
        Self {
            remote,
            local,
            timeout,
        }
    }

    /// The fallback store, shared with the sweeper.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl WindowStore for DistributedStore {
    async fn increment(&self, identifier: &str, config: &RateLimitConfig) -> WindowSnapshot {
        match self.bounded(self.remote.increment(identifier, config)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    error = %e,
                    "Distributed store unavailable, counting locally"
                );
                self.local.hit(identifier, config.window())
            }
        }
    }

    async fn peek(&self, identifier: &str, config: &RateLimitConfig) -> Option<WindowSnapshot> {
        match self.bounded(self.remote.peek(identifier, config)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    error = %e,
                    "Distributed store unavailable, reading local window"
                );
                self.local.snapshot(identifier)
            }
        }
    }

    async fn reset(&self, identifier: &str) {
        self.local.remove(identifier);
        if let Err(e) = self.bounded(self.remote.reset(identifier)).await {
            warn!(
                identifier = %identifier,
                error = %e,
                "Failed to reset identifier in distributed store"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config(max_requests: u64) -> RateLimitConfig {
        RateLimitConfig::new(max_requests, Duration::from_secs(60), "limited").unwrap()
    }

    fn distributed_config(url: &str) -> DistributedConfig {
        DistributedConfig {
            url: url.to_string(),
            token: None,
            key_prefix: "test".to_string(),
            timeout: Duration::from_millis(200),
        }
    }

    /// Always errors, as if Redis refused the connection.
    struct Unreachable;

    #[async_trait]
    impl RemoteWindow for Unreachable {
        async fn increment(&self, _: &str, _: &RateLimitConfig) -> Result<WindowSnapshot> {
            Err(QuotaError::Backend("connection refused".to_string()))
        }

        async fn peek(&self, _: &str, _: &RateLimitConfig) -> Result<Option<WindowSnapshot>> {
            Err(QuotaError::Backend("connection refused".to_string()))
        }

        async fn reset(&self, _: &str) -> Result<()> {
            Err(QuotaError::Backend("connection refused".to_string()))
        }
    }

    /// Never answers within any sane timeout.
    struct Stalled;

    #[async_trait]
    impl RemoteWindow for Stalled {
        async fn increment(&self, _: &str, _: &RateLimitConfig) -> Result<WindowSnapshot> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(QuotaError::Backend("unreachable".to_string()))
        }

        async fn peek(&self, _: &str, _: &RateLimitConfig) -> Result<Option<WindowSnapshot>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn reset(&self, _: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    /// Healthy remote with a fixed answer, counting calls.
    #[derive(Default)]
    struct Healthy {
        calls: AtomicU64,
    }

    #[async_trait]
    impl RemoteWindow for Healthy {
        async fn increment(&self, _: &str, config: &RateLimitConfig) -> Result<WindowSnapshot> {
            let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(WindowSnapshot {
                count: count * 100,
                window_reset_at: window_end(Utc::now(), config.window()),
            })
        }

        async fn peek(&self, _: &str, _: &RateLimitConfig) -> Result<Option<WindowSnapshot>> {
            Ok(None)
        }

        async fn reset(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_answer_is_used_when_healthy() {
        let local = Arc::new(LocalStore::new());
        let remote = Arc::new(Healthy::default());
        let store = DistributedStore::new(remote.clone(), local.clone(), Duration::from_secs(1));

        let snapshot = store.increment("client", &config(5)).await;

        assert_eq!(snapshot.count, 100);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_falls_back_to_local() {
        let local = Arc::new(LocalStore::new());
        let store = DistributedStore::new(Arc::new(Unreachable), local.clone(), Duration::from_secs(1));

        assert_eq!(store.increment("client", &config(5)).await.count, 1);
        assert_eq!(store.increment("client", &config(5)).await.count, 2);
        assert_eq!(local.snapshot("client").unwrap().count, 2);
        assert_eq!(store.peek("client", &config(5)).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_backend_timeout_falls_back_to_local() {
        let local = Arc::new(LocalStore::new());
        let store = DistributedStore::new(Arc::new(Stalled), local.clone(), Duration::from_millis(100));

        let snapshot = store.increment("client", &config(5)).await;
        assert_eq!(snapshot.count, 1);

        store.reset("client").await;
        assert!(local.snapshot("client").is_none());
    }

    #[tokio::test]
    async fn test_reset_clears_local_even_if_remote_fails() {
        let local = Arc::new(LocalStore::new());
        let store = DistributedStore::new(Arc::new(Unreachable), local.clone(), Duration::from_secs(1));

        store.increment("client", &config(5)).await;
        store.reset("client").await;

        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back() {
        let local = Arc::new(LocalStore::new());
        let store = Backend::Distributed(distributed_config("redis://127.0.0.1:1/"))
            .into_store(local.clone())
            .unwrap();

        assert_eq!(store.increment("client", &config(5)).await.count, 1);
        assert_eq!(store.increment("client", &config(5)).await.count, 2);
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_backs_off() {
        let window = RedisWindow::new(&distributed_config("redis://127.0.0.1:1/")).unwrap();

        // Refused or still retrying, either way the attempt is recorded.
        let first = tokio::time::timeout(
            Duration::from_millis(200),
            window.increment("client", &config(5)),
        )
        .await;
        assert!(!matches!(first, Ok(Ok(_))));

        let started = Instant::now();
        let second = window.increment("client", &config(5)).await;
        assert!(matches!(second, Err(QuotaError::Backend(_))));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_token_becomes_password() {
        let mut cfg = distributed_config("rediss://cache.example.com:6379");
        cfg.token = Some("s3cret".to_string());

        let window = RedisWindow::new(&cfg).unwrap();
        let info = window.client.get_connection_info();
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        assert!(RedisWindow::new(&distributed_config("not a url")).is_err());
    }

    #[test]
    fn test_keys_are_prefixed() {
        let window = RedisWindow::new(&distributed_config("redis://127.0.0.1:6379")).unwrap();
        assert_eq!(window.key("203.0.113.9"), "test:203.0.113.9");
        assert_eq!(window.key(""), "test:");
    }

    #[test]
    fn test_window_millis_is_clamped() {
        assert_eq!(window_millis(&config(1)), 60_000);

        let huge = RateLimitConfig::new(1, Duration::from_secs(u64::MAX), "x").unwrap();
        assert_eq!(window_millis(&huge), MAX_WINDOW_MS);
    }

    #[test]
    fn test_reset_time_from_oldest_hit() {
        let reset = reset_time(1_700_000_000_000, 60_000, &config(1));
        assert_eq!(reset.timestamp_millis(), 1_700_000_060_000);
    }

    #[tokio::test]
    async fn test_local_backend_is_the_local_store() {
        let local = Arc::new(LocalStore::new());
        let store = Backend::Local.into_store(local.clone()).unwrap();

        store.increment("client", &config(5)).await;
        assert_eq!(local.snapshot("client").unwrap().count, 1);
    }
}
