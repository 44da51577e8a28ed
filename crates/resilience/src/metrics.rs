//! Metric helpers
//!
//! Records through the `metrics` facade; without an installed recorder every
//! call is a no-op. Names:
//!
//! - `client_requests_total` (counter): labels `method`, `status`
//! - `client_request_duration_seconds` (histogram): label `status`
//! - `client_retries_total` (counter): label `reason`
//! - `client_refresh_total` (counter): label `reason`
//! - `client_queue_pending` / `client_queue_active` (gauges)

pub const REQUEST_DURATION: &str = "client_request_duration_seconds";

/// Histogram buckets from 5ms to 60s, covering the configurable timeout range.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Record a finished request. `status` is 0 for transport failures.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("client_requests_total", "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION, "status" => status).record(duration_secs);
}

/// Record a retry about to be attempted.
pub fn record_retry(reason: &'static str) {
    metrics::counter!("client_retries_total", "reason" => reason).increment(1);
}

/// Record a refresh outcome.
pub fn record_refresh(reason: &'static str) {
    metrics::counter!("client_refresh_total", "reason" => reason).increment(1);
}

/// Publish admission queue depth.
pub fn set_queue_gauges(pending: usize, active: usize) {
    metrics::gauge!("client_queue_pending").set(pending as f64);
    metrics::gauge!("client_queue_active").set(active as f64);
}
