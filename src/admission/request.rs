//! The request-side view the admission layer needs.

use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Identification signals extracted from an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` value
    pub real_ip: Option<String>,
    /// Address of the directly connected peer
    pub remote_addr: Option<IpAddr>,
    /// Opaque value for a custom identifier function, e.g. a user id
    pub custom_key: Option<String>,
}

impl AdmissionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the forwarding headers from an HTTP header map.
    ///
    /// Header values that are not valid visible ASCII are ignored.
    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            forwarded_for: header(FORWARDED_FOR),
            real_ip: header(REAL_IP),
            remote_addr: remote_addr.map(|addr| addr.ip()),
            custom_key: None,
        }
    }

    pub fn forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    pub fn remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn custom_key(mut self, key: impl Into<String>) -> Self {
        self.custom_key = Some(key.into());
        self
    }
}
