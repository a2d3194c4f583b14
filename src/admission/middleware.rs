//! Per-request admission flow.
//!
//! `START -> LOOKUP_CONFIG -> RESOLVE_IDENTIFIER -> CHECK -> {ALLOW, DENY}`.
//! The tier is looked up before the identifier is resolved because a tier
//! may carry its own identifier function.

use chrono::Utc;
use http::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, instrument, warn};

use super::request::AdmissionRequest;
use super::response::{quota_headers, Rejection};
use crate::error::{QuotaError, Result};
use crate::ratelimit::{
    IdentifierResolver, RateLimitConfig, RateLimitResult, RateLimiter, Tier, TierRegistry,
};

/// What to do when admission cannot reach a decision, e.g. an unknown tier
/// name or a failing identifier function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through and log the failure.
    #[default]
    Open,
    /// Reject with `503 Service Unavailable`. For critical call sites.
    Closed,
}

/// Which quota policy applies to a call.
#[derive(Debug, Clone)]
pub enum TierSelector {
    Tier(Tier),
    /// Looked up by name; an unknown name is a wiring bug.
    Named(String),
    /// An ad-hoc policy outside the registry.
    Config(Arc<RateLimitConfig>),
}

impl From<Tier> for TierSelector {
    fn from(tier: Tier) -> Self {
        TierSelector::Tier(tier)
    }
}

impl From<&str> for TierSelector {
    fn from(name: &str) -> Self {
        TierSelector::Named(name.to_string())
    }
}

impl From<String> for TierSelector {
    fn from(name: String) -> Self {
        TierSelector::Named(name)
    }
}

impl From<RateLimitConfig> for TierSelector {
    fn from(config: RateLimitConfig) -> Self {
        TierSelector::Config(Arc::new(config))
    }
}

impl From<Arc<RateLimitConfig>> for TierSelector {
    fn from(config: Arc<RateLimitConfig>) -> Self {
        TierSelector::Config(config)
    }
}

/// Outcome of [`Admission::admit`].
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    /// Whether the handler may run
    pub allowed: bool,
    /// The limiter's decision; `None` when admission failed open
    pub result: Option<RateLimitResult>,
    /// Present whenever `allowed` is false
    pub rejection: Option<Rejection>,
    /// The key the request was counted under
    pub identifier: Option<String>,
}

impl AdmissionDecision {
    /// Quota headers for a successful response. Empty if no check ran.
    pub fn headers(&self) -> HeaderMap {
        self.result.as_ref().map(quota_headers).unwrap_or_default()
    }
}

/// Handler output together with the quota headers to attach to it.
#[derive(Debug)]
pub struct Admitted<T> {
    pub output: T,
    pub headers: HeaderMap,
    pub result: Option<RateLimitResult>,
}

/// Admission middleware: resolves, looks up, checks, and shapes the outcome.
#[derive(Clone)]
pub struct Admission {
    limiter: RateLimiter,
    registry: Arc<TierRegistry>,
    resolver: IdentifierResolver,
}

impl Admission {
    pub fn new(limiter: RateLimiter, registry: Arc<TierRegistry>) -> Self {
        Self {
            limiter,
            registry,
            resolver: IdentifierResolver::new(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    /// Admit or reject a request, failing open on internal errors.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        tier: impl Into<TierSelector>,
    ) -> AdmissionDecision {
        self.admit_with_policy(request, tier, FailurePolicy::Open).await
    }

    /// Admit or reject a request with an explicit failure policy.
    #[instrument(skip_all)]
    pub async fn admit_with_policy(
        &self,
        request: &AdmissionRequest,
        tier: impl Into<TierSelector>,
        policy: FailurePolicy,
    ) -> AdmissionDecision {
        let config = match self.lookup(tier.into()) {
            Ok(config) => config,
            Err(e) => return Self::failed(policy, e),
        };

        let identifier = match self.resolver.resolve(request, &config).await {
            Ok(identifier) => identifier,
            Err(e) if policy == FailurePolicy::Open => {
                // Still count the request, under its network identity.
                let fallback = IdentifierResolver::from_headers(request);
                warn!(
                    error = %e,
                    identifier = %fallback,
                    "Custom identifier failed, using request address"
                );
                fallback
            }
            Err(e) => return Self::failed(policy, e),
        };

        let result = self.limiter.check(&identifier, &config).await;

        if result.allowed {
            AdmissionDecision {
                allowed: true,
                result: Some(result),
                rejection: None,
                identifier: Some(identifier),
            }
        } else {
            AdmissionDecision {
                allowed: false,
                result: Some(result),
                rejection: Some(Rejection::quota_exceeded(&result, config.message(), Utc::now())),
                identifier: Some(identifier),
            }
        }
    }

    /// Run `handler` only if the request is admitted.
    ///
    /// On success the handler's output is returned untouched alongside the
    /// quota headers; on denial the handler never runs.
    pub async fn admit_with<F, Fut, T>(
        &self,
        request: &AdmissionRequest,
        tier: impl Into<TierSelector>,
        handler: F,
    ) -> std::result::Result<Admitted<T>, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.admit(request, tier).await;
        if let Some(rejection) = decision.rejection {
            return Err(rejection);
        }

        let headers = decision.headers();
        let output = handler().await;
        Ok(Admitted {
            output,
            headers,
            result: decision.result,
        })
    }

    fn lookup(&self, selector: TierSelector) -> Result<Arc<RateLimitConfig>> {
        match selector {
            TierSelector::Tier(tier) => Ok(self.registry.get(tier).clone()),
            TierSelector::Named(name) => self.registry.by_name(&name).cloned(),
            TierSelector::Config(config) => Ok(config),
        }
    }

    fn failed(policy: FailurePolicy, err: QuotaError) -> AdmissionDecision {
        match policy {
            FailurePolicy::Open => {
                warn!(error = %err, "Admission failed, allowing request without rate limiting");
                AdmissionDecision {
                    allowed: true,
                    result: None,
                    rejection: None,
                    identifier: None,
                }
            }
            FailurePolicy::Closed => {
                error!(error = %err, "Admission failed, rejecting request");
                AdmissionDecision {
                    allowed: false,
                    result: None,
                    rejection: Some(Rejection::unavailable("Rate limiter unavailable")),
                    identifier: None,
                }
            }
        }
    }
}
