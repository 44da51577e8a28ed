//! Transport and connectivity abstractions for the API client
//!
//! Defines the two I/O seams the resilience layer consumes:
//! - `Transport` sends one HTTP request and returns status, headers and body
//!   text, or a transport-level error (DNS, refused connection, broken body)
//! - `ConnectivityProbe` answers "is the device online right now?"
//!
//! `ReqwestTransport` is the production transport. Probes come in three
//! flavours: `AlwaysOnline`, `ManualProbe` (flipped by the host application)
//! and `TcpProbe` (opens a TCP connection to a known host).
//!
//! Cancellation is by drop: the executor races `send` against its timer and
//! dropping the future aborts the in-flight call.

pub mod probe;
pub mod reqwest_transport;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use probe::{AlwaysOnline, ManualProbe, TcpProbe};
pub use reqwest_transport::ReqwestTransport;

pub use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode, Url};

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// A fully built request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// A received response. The body is read eagerly as text.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Transport-level failures: nothing usable came back from the server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport timed out: {0}")]
    Timeout(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Reachability as reported by a `ConnectivityProbe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    pub connected: bool,
}

impl Connectivity {
    pub const ONLINE: Connectivity = Connectivity { connected: true };
    pub const OFFLINE: Connectivity = Connectivity { connected: false };
}

/// Sends a single HTTP request.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
/// Implementations must not retry; retries belong to the resilience layer.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>>;
}

/// Reports whether the network is currently reachable.
pub trait ConnectivityProbe: Send + Sync {
    fn check(&self) -> Pin<Box<dyn Future<Output = Connectivity> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_is_2xx() {
        let mut response = TransportResponse {
            status: 204,
            headers: HeaderMap::new(),
            body: String::new(),
        };
        assert!(response.is_success());
        response.status = 301;
        assert!(!response.is_success());
        response.status = 199;
        assert!(!response.is_success());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("10"));
        let response = TransportResponse {
            status: 429,
            headers,
            body: String::new(),
        };
        assert_eq!(response.header("Retry-After"), Some("10"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::Connect("dns error".into());
        assert_eq!(err.to_string(), "connection failed: dns error");
    }
}
