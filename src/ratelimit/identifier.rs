//! Rate limit key derivation.
//!
//! Precedence, first match wins:
//!
//! 1. the tier's custom identifier function, if one is attached
//! 2. the first entry of `X-Forwarded-For`, trimmed
//! 3. `X-Real-IP`
//! 4. the raw connection address
//! 5. the literal [`UNKNOWN_IDENTIFIER`]
//!
//! Known limitation: the forwarded entry is taken as-is. Behind a proxy that
//! strips client-supplied forwarding headers this is the real client; without
//! one, a client can pick its own key by sending the header itself.

use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use tracing::trace;

use crate::admission::AdmissionRequest;
use crate::error::Result;

use super::rules::RateLimitConfig;

/// Sentinel key used when a request carries no usable signal.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Caller-supplied key derivation, e.g. an authenticated user id.
///
/// Returning `Ok(None)` defers to the header-based rules; an error is
/// handled by the admission layer's failure policy.
#[async_trait]
pub trait IdentifierFn: Send + Sync {
    async fn identify(&self, request: &AdmissionRequest) -> Result<Option<String>>;
}

/// Adapter so plain async closures can serve as identifier functions.
pub struct FnIdentifier<F>(pub F);

#[async_trait]
impl<F, Fut> IdentifierFn for FnIdentifier<F>
where
    F: Fn(AdmissionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>>> + Send,
{
    async fn identify(&self, request: &AdmissionRequest) -> Result<Option<String>> {
        (self.0)(request.clone()).await
    }
}

/// Resolves the rate limit key for a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierResolver;

impl IdentifierResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the key for `request` under `config`.
    ///
    /// Only a failing custom identifier function produces an error.
    pub async fn resolve(
        &self,
        request: &AdmissionRequest,
        config: &RateLimitConfig,
    ) -> Result<String> {
        if let Some(identifier_fn) = config.identifier_fn() {
            if let Some(key) = identifier_fn.identify(request).await? {
                trace!(identifier = %key, source = "custom", "Resolved identifier");
                return Ok(key);
            }
        }

        let key = Self::from_headers(request);
        trace!(identifier = %key, "Resolved identifier");
        Ok(key)
    }

    /// Header and connection based resolution, steps 2 through 5.
    pub fn from_headers(request: &AdmissionRequest) -> String {
        if let Some(first) = request
            .forwarded_for
            .as_deref()
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
        {
            return first.to_string();
        }

        if let Some(real_ip) = request
            .real_ip
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return real_ip.to_string();
        }

        request
            .remote_addr
            .map(|addr: IpAddr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
    }
}
