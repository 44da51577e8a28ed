//! `Retry-After` header parsing
//!
//! The header is either delta-seconds (`120`, fractional values tolerated)
//! or an HTTP-date. All three HTTP-date forms are accepted: IMF-fixdate
//! (`Wed, 21 Oct 2015 07:28:00 GMT`), the obsolete RFC 850 form
//! (`Wednesday, 21-Oct-15 07:28:00 GMT`) and asctime
//! (`Wed Oct 21 07:28:00 2015`). Dates in the past yield zero.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

const RFC850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";
use transport::TransportResponse;

/// Parse a `Retry-After` value relative to `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_nan() {
            return None;
        }
        return Duration::try_from_secs_f64(seconds.max(0.0)).ok();
    }
    let at = parse_http_date(value)?;
    let delta = at - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(value, RFC850_FORMAT) {
        return Some(at.and_utc());
    }
    // asctime pads single-digit days with a space
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&collapsed, ASCTIME_FORMAT)
        .ok()
        .map(|at| at.and_utc())
}

/// `Retry-After` from a response, if present and parseable.
pub fn retry_after_header(response: &TransportResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| parse_retry_after(v, Utc::now()))
}
