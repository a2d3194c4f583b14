//! Admission control for inbound API calls.
//!
//! Framework-agnostic: callers translate their HTTP request into an
//! [`AdmissionRequest`], call [`Admission::admit`], and either attach the
//! quota headers to their response or send the [`Rejection`] as-is.

mod middleware;
mod request;
mod response;

pub use middleware::{Admission, AdmissionDecision, Admitted, FailurePolicy, TierSelector};
pub use request::AdmissionRequest;
pub use response::{
    quota_headers, Rejection, RejectionBody, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
