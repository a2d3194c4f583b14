//! Tier definitions and the registry that maps tiers to quota policy.
//!
//! The registry is built once at startup from the built-in table plus any
//! overrides from configuration. Every entry is validated on the way in, so
//! a bad definition stops the process instead of misbehaving per request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::identifier::IdentifierFn;
use crate::error::{QuotaError, Result};

/// Named quota policies exposed to configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Standard,
    Elevated,
    Restricted,
}

impl Tier {
    /// All tiers, in registry order.
    pub const ALL: [Tier; 4] = [
        Tier::Anonymous,
        Tier::Standard,
        Tier::Elevated,
        Tier::Restricted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Standard => "standard",
            Tier::Elevated => "elevated",
            Tier::Restricted => "restricted",
        }
    }

    fn index(self) -> usize {
        match self {
            Tier::Anonymous => 0,
            Tier::Standard => 1,
            Tier::Elevated => 2,
            Tier::Restricted => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| QuotaError::UnknownTier(s.to_string()))
    }
}

/// A tier definition as written in configuration, before validation.
///
/// Signed and floating point on purpose so that negative or fractional
/// input reaches the validator instead of failing inside serde with a
/// less useful message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Requests allowed per window
    pub max_requests: i64,
    /// Window length in seconds
    pub window_seconds: f64,
    /// Message returned to denied callers
    pub message: String,
}

/// Validated, immutable quota policy for one tier.
#[derive(Clone)]
pub struct RateLimitConfig {
    max_requests: u64,
    window: Duration,
    message: String,
    identifier_fn: Option<Arc<dyn IdentifierFn>>,
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("message", &self.message)
            .field("identifier_fn", &self.identifier_fn.is_some())
            .finish()
    }
}

impl RateLimitConfig {
    /// Create a config, rejecting a zero-length window.
    pub fn new(max_requests: u64, window: Duration, message: impl Into<String>) -> Result<Self> {
        if window.is_zero() {
            return Err(QuotaError::InvalidTier {
                tier: "<inline>".to_string(),
                reason: "window must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            max_requests,
            window,
            message: message.into(),
            identifier_fn: None,
        })
    }

    /// Validate a configuration entry for the named tier.
    pub fn from_spec(tier: &str, spec: &TierSpec) -> Result<Self> {
        let invalid = |reason: String| QuotaError::InvalidTier {
            tier: tier.to_string(),
            reason,
        };

        if spec.max_requests < 0 {
            return Err(invalid(format!(
                "max_requests must be >= 0, got {}",
                spec.max_requests
            )));
        }
        if !spec.window_seconds.is_finite() || spec.window_seconds <= 0.0 {
            return Err(invalid(format!(
                "window_seconds must be a positive number, got {}",
                spec.window_seconds
            )));
        }
        let window = Duration::try_from_secs_f64(spec.window_seconds)
            .map_err(|e| invalid(format!("window_seconds out of range: {}", e)))?;
        if window.is_zero() {
            return Err(invalid("window_seconds rounds down to zero".to_string()));
        }

        Ok(Self {
            max_requests: spec.max_requests as u64,
            window,
            message: spec.message.clone(),
            identifier_fn: None,
        })
    }

    /// Attach a custom identifier function, consulted before any header.
    pub fn with_identifier(mut self, identifier_fn: Arc<dyn IdentifierFn>) -> Self {
        self.identifier_fn = Some(identifier_fn);
        self
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn identifier_fn(&self) -> Option<&Arc<dyn IdentifierFn>> {
        self.identifier_fn.as_ref()
    }

    /// The configuration-file form of this policy.
    pub fn to_spec(&self) -> TierSpec {
        TierSpec {
            max_requests: i64::try_from(self.max_requests).unwrap_or(i64::MAX),
            window_seconds: self.window.as_secs_f64(),
            message: self.message.clone(),
        }
    }
}

/// Built-in quota table, used for any tier not overridden in configuration.
fn builtin(tier: Tier) -> RateLimitConfig {
    let (max_requests, window_secs, message) = match tier {
        Tier::Anonymous => (
            30,
            60,
            "Too many requests. Sign in for a higher limit.",
        ),
        Tier::Standard => (100, 60, "Rate limit exceeded. Please slow down."),
        Tier::Elevated => (1000, 60, "Rate limit exceeded for your plan."),
        Tier::Restricted => (
            10,
            60,
            "This account is restricted. Please try again later.",
        ),
    };
    RateLimitConfig {
        max_requests,
        window: Duration::from_secs(window_secs),
        message: message.to_string(),
        identifier_fn: None,
    }
}

/// Fixed table of tier policies. Read-only once built.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    tiers: [Arc<RateLimitConfig>; 4],
}

impl TierRegistry {
    /// The built-in table with no overrides.
    pub fn builtin() -> Self {
        Self {
            tiers: Tier::ALL.map(|tier| Arc::new(builtin(tier))),
        }
    }

    /// Built-in table with validated overrides applied.
    pub fn from_specs(overrides: &HashMap<Tier, TierSpec>) -> Result<Self> {
        let mut registry = Self::builtin();
        for (tier, spec) in overrides {
            let config = RateLimitConfig::from_spec(tier.as_str(), spec)?;
            info!(
                tier = %tier,
                max_requests = config.max_requests,
                window = ?config.window,
                "Tier override loaded"
            );
            registry.tiers[tier.index()] = Arc::new(config);
        }
        Ok(registry)
    }

    /// Replace one tier's policy. Intended for startup wiring, e.g. attaching
    /// an identifier function, before the registry is shared.
    pub fn with_tier(mut self, tier: Tier, config: RateLimitConfig) -> Self {
        self.tiers[tier.index()] = Arc::new(config);
        self
    }

    /// Look up a tier. Every tier is always present.
    pub fn get(&self, tier: Tier) -> &Arc<RateLimitConfig> {
        &self.tiers[tier.index()]
    }

    /// Look up a tier by its configuration name.
    ///
    /// An unknown name is a wiring bug in the caller, so it is logged at
    /// error level as well as returned.
    pub fn by_name(&self, name: &str) -> Result<&Arc<RateLimitConfig>> {
        match name.parse::<Tier>() {
            Ok(tier) => Ok(self.get(tier)),
            Err(e) => {
                error!(tier = %name, "Unknown tier requested");
                Err(e)
            }
        }
    }

    /// The shortest window across all tiers.
    pub fn smallest_window(&self) -> Duration {
        self.tiers
            .iter()
            .map(|config| config.window)
            .min()
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tier, &Arc<RateLimitConfig>)> {
        Tier::ALL.into_iter().zip(self.tiers.iter())
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
