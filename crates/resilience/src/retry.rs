//! Retry policy engine
//!
//! Wraps a fallible async operation with failure classification and
//! exponential backoff. Classification is a fixed table (status set plus
//! message substrings) so it can be audited and tested on its own.
//!
//! Before every attempt after the first, the connectivity probe is consulted;
//! an offline device fails immediately instead of burning a retry.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use transport::{ConnectivityProbe, TransportError};

use crate::error::{ApiError, ErrorKind};
use crate::metrics;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];
pub const DEFAULT_RETRYABLE_MESSAGES: [&str; 3] = ["network error", "timeout", "failed to fetch"];

/// Floor for 429 backoff.
pub const RATE_LIMIT_MIN_DELAY: Duration = Duration::from_millis(5000);
/// 429 backoff multiplier over the exponential delay.
pub const RATE_LIMIT_MULTIPLIER: u32 = 5;

/// Retry configuration. Fields missing from a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub retryable_statuses: BTreeSet<u16>,
    /// Case-insensitive substrings matched against status-0 error messages.
    pub retryable_messages: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            retryable_messages: DEFAULT_RETRYABLE_MESSAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self
    }

    /// Whether a failure with this status and message should be retried.
    ///
    /// `None` and `Some(0)` both mean "no HTTP status" and fall through to
    /// substring matching on the message.
    pub fn is_retryable(&self, status: Option<u16>, message: &str) -> bool {
        match status {
            Some(status) if status != 0 => self.retryable_statuses.contains(&status),
            _ => {
                let lower = message.to_lowercase();
                self.retryable_messages
                    .iter()
                    .any(|needle| lower.contains(&needle.to_lowercase()))
            }
        }
    }

    /// Backoff before attempt `attempt + 1`, given attempt `attempt` failed.
    ///
    /// `base * 2^(attempt-1)`; a 429 waits `max(5s, 5 * that)`.
    pub fn delay_for(&self, attempt: u32, status: Option<u16>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent));
        if status == Some(429) {
            RATE_LIMIT_MIN_DELAY.max(delay.saturating_mul(RATE_LIMIT_MULTIPLIER))
        } else {
            delay
        }
    }
}

/// Errors the engine can classify.
pub trait Retryable: Display {
    /// HTTP-like status, or `None` for errors that carry none.
    fn status(&self) -> Option<u16>;
}

impl Retryable for ApiError {
    fn status(&self) -> Option<u16> {
        Some(self.status)
    }
}

impl Retryable for TransportError {
    fn status(&self) -> Option<u16> {
        None
    }
}

/// Run `op` under `policy`, returning the first success or the last error.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    probe: &dyn ConnectivityProbe,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + From<ApiError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if attempt > 1 && !probe.check().await.connected {
            warn!(attempt, "offline, abandoning retries");
            return Err(E::from(ApiError::offline()));
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let status = err.status();
        let message = err.to_string();
        if !policy.is_retryable(status, &message) {
            debug!(attempt, ?status, "non-retryable failure");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(attempt, ?status, error = %message, "retries exhausted");
            return Err(err);
        }

        let delay = policy.delay_for(attempt, status);
        let reason = ErrorKind::from_status(status.unwrap_or(0)).label();
        metrics::record_retry(reason);
        warn!(
            attempt,
            ?status,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying after failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use transport::{AlwaysOnline, ManualProbe};

    fn counting<'a>(
        calls: &'a AtomicU32,
        fail_times: u32,
        failure: ApiError,
    ) -> impl FnMut() -> std::future::Ready<Result<&'static str, ApiError>> + 'a {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= fail_times {
                Err(failure.clone())
            } else {
                Ok("done")
            })
        }
    }

    #[test]
    fn default_classification_table() {
        let policy = RetryPolicy::default();
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(policy.is_retryable(Some(status), ""), "{status}");
        }
        for status in [400, 401, 403, 404, 422, 501] {
            assert!(!policy.is_retryable(Some(status), "timeout"), "{status}");
        }
    }

    #[test]
    fn status_zero_matches_messages_case_insensitively() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(Some(0), "Network error: connection refused"));
        assert!(policy.is_retryable(None, "Operation TIMEOUT"));
        assert!(policy.is_retryable(None, "TypeError: Failed to fetch"));
        assert!(!policy.is_retryable(Some(0), "Request cancelled"));
        assert!(!policy.is_retryable(None, "something odd"));
    }

    #[test]
    fn exponential_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, Some(503)), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, Some(503)), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(4000));
    }

    #[test]
    fn rate_limit_delay_never_below_five_seconds() {
        for base in [0, 1, 10, 100, 999, 1000] {
            let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(base));
            for attempt in 1..=4 {
                assert!(policy.delay_for(attempt, Some(429)) >= RATE_LIMIT_MIN_DELAY);
            }
        }
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(2000));
        assert_eq!(policy.delay_for(1, Some(429)), Duration::from_millis(10_000));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(200, Some(429)) >= RATE_LIMIT_MIN_DELAY);
    }

    #[test]
    fn partial_config_merges_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts":5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert!(policy.retryable_statuses.contains(&503));
        assert_eq!(policy.retryable_messages.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_runs_once() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            &RetryPolicy::default(),
            &AlwaysOnline,
            counting(&calls, 10, ApiError::http(400, "bad", None)),
        )
        .await;

        assert_eq!(result.unwrap_err().status, 400);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_503_then_succeeds() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = with_retry(
            &RetryPolicy::default().with_max_attempts(3),
            &AlwaysOnline,
            counting(&calls, 2, ApiError::http(503, "unavailable", None)),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1000 + 2000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            &RetryPolicy::default().with_max_attempts(2),
            &AlwaysOnline,
            counting(&calls, 10, ApiError::http(502, "bad gateway", None)),
        )
        .await;

        assert_eq!(result.unwrap_err().message, "bad gateway");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_waits_at_least_five_seconds() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(10));
        let result = with_retry(
            &policy,
            &AlwaysOnline,
            counting(
                &calls,
                1,
                ApiError::rate_limited("slow", Duration::from_secs(1), serde_json::Value::Null),
            ),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_before_retry_fails_fast() {
        let calls = AtomicU32::new(0);
        let probe = ManualProbe::new(false);
        let result = with_retry(
            &RetryPolicy::default(),
            &probe,
            counting(&calls, 10, ApiError::network("connection refused")),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.status, 0);
        assert_eq!(err, ApiError::offline());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_errors_classified_by_message() {
        #[derive(Debug)]
        struct Plain(&'static str);
        impl Display for Plain {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.0)
            }
        }
        impl Retryable for Plain {
            fn status(&self) -> Option<u16> {
                None
            }
        }
        impl From<ApiError> for Plain {
            fn from(_: ApiError) -> Self {
                Plain("offline")
            }
        }

        let calls = AtomicU32::new(0);
        let result: Result<(), Plain> = with_retry(&RetryPolicy::default(), &AlwaysOnline, || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(Plain("request timeout")))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), Plain> = with_retry(&RetryPolicy::default(), &AlwaysOnline, || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(Plain("invalid input")))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
