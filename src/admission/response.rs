//! Quota headers and structured rejections.

use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitResult;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// (epoch seconds) for a decision.
pub fn quota_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    headers.insert(HEADER_LIMIT, HeaderValue::from(result.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(result.reset_epoch_secs()));
    headers
}

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<i64>,
}

/// A request the admission layer refused to pass to the handler.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RejectionBody,
}

impl Rejection {
    /// `429 Too Many Requests` for an exhausted quota.
    pub fn quota_exceeded(result: &RateLimitResult, message: &str, now: DateTime<Utc>) -> Self {
        let mut headers = quota_headers(result);
        headers.insert(RETRY_AFTER, HeaderValue::from(result.retry_after_secs(now)));

        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: RejectionBody {
                error: message.to_string(),
                limit: Some(result.limit),
                remaining: Some(result.remaining),
                reset: Some(result.reset_epoch_secs()),
            },
        }
    }

    /// `503 Service Unavailable` when admission itself failed on a
    /// fail-closed call site.
    pub fn unavailable(message: &str) -> Self {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(RETRY_AFTER, HeaderValue::from(1u64));

        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body: RejectionBody {
                error: message.to_string(),
                limit: None,
                remaining: None,
                reset: None,
            },
        }
    }

    /// Seconds from the `Retry-After` header, if present.
    pub fn retry_after(&self) -> Option<u64> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    /// The body serialized as JSON.
    pub fn body_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_default()
    }

    /// Build the full HTTP response.
    pub fn into_response(self) -> Response<String> {
        let body = self.body_json();
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}
