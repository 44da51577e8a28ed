//! Structured error surfaced to API callers
//!
//! Every failure that leaves the resilience layer is an `ApiError`: a
//! human-readable message, an HTTP-like status (0 for transport-level
//! failures) and an optional JSON payload. `ErrorKind` is the
//! machine-checkable class derived from where the error was produced.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use transport::TransportError;

/// Failure class of an `ApiError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport unreachable, DNS failure, or device offline (status 0).
    Network,
    /// Request deadline fired (status 408).
    Timeout,
    /// Server throttled the request (status 429).
    RateLimited,
    /// 401 that credential refresh could not recover.
    AuthExpired,
    /// 5xx.
    Server,
    /// Any other 4xx.
    Client,
    /// 2xx with a body that is not valid JSON.
    Parse,
    /// Dropped from the admission queue before dispatch.
    Cancelled,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Parse => "parse",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Class for a non-2xx HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            0 => ErrorKind::Network,
            401 => ErrorKind::AuthExpired,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Client,
        }
    }
}

/// Error returned by every client operation.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    pub status: u16,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status: u16, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            status,
            kind,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Transport-level failure. The `Network error:` prefix is what the
    /// retry classification table matches on.
    pub fn network(detail: impl std::fmt::Display) -> Self {
        Self::new(format!("Network error: {detail}"), 0, ErrorKind::Network)
    }

    /// Device reported offline by the connectivity probe.
    pub fn offline() -> Self {
        Self::new(
            "No network connection. Check your internet connection.",
            0,
            ErrorKind::Network,
        )
    }

    /// Request deadline exceeded.
    pub fn timeout(after: Duration) -> Self {
        let ms = after.as_millis() as u64;
        Self::new(
            format!("Request timed out after {ms}ms"),
            408,
            ErrorKind::Timeout,
        )
        .with_payload(json!({ "timeoutMs": ms }))
    }

    /// 429 with the server payload merged with `retryAfter` (seconds) and
    /// `retryAfterMs`.
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration, payload: Value) -> Self {
        let mut merged = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let ms = retry_after.as_millis() as u64;
        merged.insert("retryAfter".into(), json!(ms.div_ceil(1000)));
        merged.insert("retryAfterMs".into(), json!(ms));
        Self::new(message, 429, ErrorKind::RateLimited).with_payload(Value::Object(merged))
    }

    /// Unrecoverable authentication failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(message, 401, ErrorKind::AuthExpired)
    }

    /// Non-2xx HTTP response.
    pub fn http(status: u16, message: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            message: message.into(),
            status,
            kind: ErrorKind::from_status(status),
            payload,
        }
    }

    /// 2xx response whose body could not be decoded.
    pub fn parse(status: u16, detail: impl std::fmt::Display) -> Self {
        Self::new(
            format!("Invalid response body: {detail}"),
            status,
            ErrorKind::Parse,
        )
    }

    /// Pending request dropped by `cancel_all`.
    pub fn cancelled() -> Self {
        Self::new("Request cancelled", 0, ErrorKind::Cancelled)
    }

    /// Server retry hint carried by a 429, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.payload
            .as_ref()?
            .get("retryAfterMs")?
            .as_u64()
            .map(Duration::from_millis)
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        ApiError::network(err)
    }
}
