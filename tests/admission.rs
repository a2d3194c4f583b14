//! End-to-end admission scenarios.

use async_trait::async_trait;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use quotagate::admission::{Admission, AdmissionRequest};
use quotagate::error::{QuotaError, Result};
use quotagate::ratelimit::{
    DistributedStore, LocalStore, RateLimitConfig, RateLimiter, RemoteWindow, Tier, TierRegistry,
    WindowSnapshot,
};

fn config(max_requests: u64, window: Duration) -> Arc<RateLimitConfig> {
    Arc::new(assert_ok!(RateLimitConfig::new(
        max_requests,
        window,
        "Too many requests, slow down"
    )))
}

fn admission() -> Admission {
    Admission::new(RateLimiter::local(), Arc::new(TierRegistry::builtin()))
}

struct DownBackend;

#[async_trait]
impl RemoteWindow for DownBackend {
    async fn increment(&self, _: &str, _: &RateLimitConfig) -> Result<WindowSnapshot> {
        Err(QuotaError::Backend("ECONNRESET".to_string()))
    }

    async fn peek(&self, _: &str, _: &RateLimitConfig) -> Result<Option<WindowSnapshot>> {
        Err(QuotaError::Backend("ECONNRESET".to_string()))
    }

    async fn reset(&self, _: &str) -> Result<()> {
        Err(QuotaError::Backend("ECONNRESET".to_string()))
    }
}

#[tokio::test]
async fn test_header_and_body_fidelity() {
    let admission = admission();
    let policy = config(2, Duration::from_secs(60));
    let request = AdmissionRequest::new().real_ip("u1");

    let first = admission.admit(&request, policy.clone()).await;
    assert!(first.allowed);
    assert_eq!(first.result.unwrap().remaining, 1);
    assert_eq!(first.identifier.as_deref(), Some("u1"));

    let second = admission.admit(&request, policy.clone()).await;
    assert!(second.allowed);
    assert_eq!(second.result.unwrap().remaining, 0);
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = admission.admit(&request, policy).await;
    assert!(!third.allowed);
    assert_eq!(third.result.unwrap().remaining, 0);

    let response = third.rejection.unwrap().into_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));
    let retry: u64 = headers[RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry), "retry-after {} out of range", retry);

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["error"], "Too many requests, slow down");
    assert_eq!(body["limit"], 2);
    assert_eq!(body["remaining"], 0);
    assert_eq!(
        body["reset"].as_i64().unwrap().to_string(),
        headers["x-ratelimit-reset"].to_str().unwrap()
    );
}

#[tokio::test]
async fn test_identifier_precedence_from_headers() {
    let admission = admission();
    let policy = config(1, Duration::from_secs(60));

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
    let remote = assert_ok!("127.0.0.1:40000".parse::<SocketAddr>());
    let request = AdmissionRequest::from_headers(&headers, Some(remote));

    let decision = admission.admit(&request, policy.clone()).await;
    assert_eq!(decision.identifier.as_deref(), Some("203.0.113.9"));

    // The direct address still has its own, untouched quota.
    let direct = AdmissionRequest::new().remote_addr(remote.ip());
    assert!(admission.admit(&direct, policy.clone()).await.allowed);

    // And the forwarded client is now exhausted.
    assert!(!admission.admit(&request, policy).await.allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_atomicity_under_load() {
    let admission = admission();
    let limit = 25u64;
    let total = 300usize;
    let policy = config(limit, Duration::from_secs(60));
    let request = AdmissionRequest::new().real_ip("198.51.100.1");

    let tasks: Vec<_> = (0..total)
        .map(|_| {
            let admission = admission.clone();
            let policy = policy.clone();
            let request = request.clone();
            tokio::spawn(async move { admission.admit(&request, policy).await })
        })
        .collect();

    let decisions: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let allowed: Vec<_> = decisions.iter().filter(|d| d.allowed).collect();
    assert_eq!(allowed.len() as u64, limit);
    assert_eq!(decisions.len() - allowed.len(), total - limit as usize);

    let mut remaining: Vec<u64> = allowed
        .iter()
        .map(|d| d.result.unwrap().remaining)
        .collect();
    remaining.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(remaining, (0..limit).rev().collect::<Vec<_>>());

    for denied in decisions.iter().filter(|d| !d.allowed) {
        assert_eq!(denied.result.unwrap().remaining, 0);
        assert!(denied.rejection.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolation_between_identifiers() {
    let admission = admission();
    let policy = config(5, Duration::from_secs(60));
    let a = AdmissionRequest::new().real_ip("192.0.2.10");
    let b = AdmissionRequest::new().real_ip("192.0.2.20");

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let admission = admission.clone();
            let policy = policy.clone();
            let a = a.clone();
            tokio::spawn(async move { admission.admit(&a, policy).await })
        })
        .collect();
    futures::future::join_all(tasks).await;

    let decision = admission.admit(&b, policy).await;
    assert!(decision.allowed);
    assert_eq!(decision.result.unwrap().remaining, 4);
}

#[tokio::test]
async fn test_window_reset_after_exhaustion() {
    let admission = admission();
    let policy = config(3, Duration::from_millis(300));
    let request = AdmissionRequest::new().real_ip("192.0.2.30");

    for _ in 0..3 {
        assert!(admission.admit(&request, policy.clone()).await.allowed);
    }
    assert!(!admission.admit(&request, policy.clone()).await.allowed);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let decision = admission.admit(&request, policy).await;
    assert!(decision.allowed);
    assert_eq!(decision.result.unwrap().remaining, 2);
}

#[tokio::test]
async fn test_zero_quota_tier() {
    let registry = TierRegistry::builtin().with_tier(
        Tier::Restricted,
        RateLimitConfig::new(0, Duration::from_secs(60), "Account suspended").unwrap(),
    );
    let admission = Admission::new(RateLimiter::local(), Arc::new(registry));
    let request = AdmissionRequest::new().real_ip("192.0.2.40");

    for _ in 0..3 {
        let decision = admission.admit(&request, Tier::Restricted).await;
        assert!(!decision.allowed);
        assert_eq!(decision.result.unwrap().remaining, 0);
        assert_eq!(decision.rejection.unwrap().body.error, "Account suspended");
    }
}

#[tokio::test]
async fn test_backend_failure_still_decides() {
    let local = Arc::new(LocalStore::new());
    let store = Arc::new(DistributedStore::new(
        Arc::new(DownBackend),
        local.clone(),
        Duration::from_millis(100),
    ));
    let admission = Admission::new(RateLimiter::new(store), Arc::new(TierRegistry::builtin()));
    let policy = config(1, Duration::from_secs(60));
    let request = AdmissionRequest::new().real_ip("192.0.2.50");

    let first = admission.admit(&request, policy.clone()).await;
    assert!(first.allowed);
    assert!(first.result.is_some());

    let second = admission.admit(&request, policy).await;
    assert!(!second.allowed);
    assert_eq!(local.len(), 1);
}

#[tokio::test]
async fn test_reset_is_idempotent_with_first_request() {
    let admission = admission();
    let policy = config(3, Duration::from_secs(60));
    let fresh = AdmissionRequest::new().real_ip("192.0.2.60");
    let reused = AdmissionRequest::new().real_ip("192.0.2.61");

    let baseline = admission.admit(&fresh, policy.clone()).await.result.unwrap();

    for _ in 0..5 {
        admission.admit(&reused, policy.clone()).await;
    }
    admission.limiter().reset("192.0.2.61").await;
    admission.limiter().reset("192.0.2.61").await;

    let after = admission.admit(&reused, policy).await.result.unwrap();
    assert_eq!(after.allowed, baseline.allowed);
    assert_eq!(after.remaining, baseline.remaining);
    assert_eq!(after.limit, baseline.limit);
}

#[tokio::test]
async fn test_builtin_tiers_have_distinct_limits() {
    let admission = admission();
    let request = AdmissionRequest::new().real_ip("192.0.2.70");

    let mut limits = HashSet::new();
    for tier in Tier::ALL {
        let decision = admission.admit(&request, tier).await;
        assert!(decision.allowed);
        limits.insert(decision.result.unwrap().limit);
    }
    assert_eq!(limits.len(), Tier::ALL.len());
}
