//! Quotagate - Admission Control for API Services
//!
//! This crate decides, for every inbound API call, whether the caller may
//! proceed. Quotas are per tier and counted per identifier in a window store:
//! an in-process fixed window, or a Redis sliding window shared by every
//! instance, with the in-process store as a per-call fallback.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use admission::{Admission, AdmissionDecision, AdmissionRequest, FailurePolicy, Rejection};
pub use error::{QuotaError, Result};
pub use ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter, Tier, TierRegistry};
