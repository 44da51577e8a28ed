//! Prometheus exposition for a probe run
//!
//! The client crates record through the `metrics` facade (see
//! `resilience::metrics` for names). With `--metrics` the binary installs a
//! Prometheus recorder and prints the exposition text after the run.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use resilience::metrics::{DURATION_BUCKETS, REQUEST_DURATION};

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(REQUEST_DURATION.to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder globally and return a handle for rendering.
///
/// Request durations render as a histogram (`_bucket` lines) rather than
/// the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}
