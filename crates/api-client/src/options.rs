//! Per-request options and query string building

use std::time::Duration;

use resilience::{ApiError, Priority, RetryPolicy};
use transport::{HeaderMap, HeaderName, HeaderValue, Url};

/// Retry behaviour for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetrySetting {
    /// Use the client's configured policy.
    #[default]
    Default,
    /// Single attempt.
    Disabled,
    Custom(RetryPolicy),
}

/// A query parameter value. Lists repeat the key; `Absent` is skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Scalar(String),
    List(Vec<String>),
    Absent,
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Scalar(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl From<u64> for QueryValue {
    fn from(value: u64) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl From<f64> for QueryValue {
    fn from(value: f64) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(QueryValue::Absent)
    }
}

impl<T: ToString> From<Vec<T>> for QueryValue {
    fn from(values: Vec<T>) -> Self {
        QueryValue::List(values.iter().map(ToString::to_string).collect())
    }
}

/// Options accepted by every verb method.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    /// Overrides the endpoint timeout table and the default.
    pub timeout: Option<Duration>,
    /// Public route: no bearer header and no refresh on 401.
    pub skip_auth: bool,
    pub retry: RetrySetting,
    /// Bypass the admission queue.
    pub skip_queue: bool,
    pub query: Vec<(String, QueryValue)>,
    /// Overrides the priority table.
    pub priority: Option<Priority>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = RetrySetting::Disabled;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetrySetting::Custom(policy);
        self
    }

    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Resolve `endpoint` against `base_url` and append query parameters.
///
/// Endpoints starting with `http://` or `https://` are used as-is.
pub fn build_url(
    base_url: &str,
    endpoint: &str,
    query: &[(String, QueryValue)],
) -> Result<Url, ApiError> {
    let raw = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        let base = base_url.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{base}{endpoint}")
        } else {
            format!("{base}/{endpoint}")
        }
    };
    let mut url = Url::parse(&raw)
        .map_err(|e| ApiError::http(400, format!("Invalid URL `{raw}`: {e}"), None))?;

    let has_params = query.iter().any(|(_, v)| match v {
        QueryValue::Scalar(_) => true,
        QueryValue::List(items) => !items.is_empty(),
        QueryValue::Absent => false,
    });
    if has_params {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            match value {
                QueryValue::Scalar(v) => {
                    pairs.append_pair(key, v);
                }
                QueryValue::List(items) => {
                    for item in items {
                        pairs.append_pair(key, item);
                    }
                }
                QueryValue::Absent => {}
            }
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience::ErrorKind;

    fn q(pairs: Vec<(&str, QueryValue)>) -> Vec<(String, QueryValue)> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn joins_base_and_endpoint() {
        let url = build_url("https://api.test/v1/", "/users", &[]).unwrap();
        assert_eq!(url.as_str(), "https://api.test/v1/users");
        let url = build_url("https://api.test/v1", "users", &[]).unwrap();
        assert_eq!(url.as_str(), "https://api.test/v1/users");
    }

    #[test]
    fn absolute_endpoint_ignores_base() {
        let url = build_url("https://api.test", "https://cdn.test/file", &[]).unwrap();
        assert_eq!(url.as_str(), "https://cdn.test/file");
    }

    #[test]
    fn arrays_repeat_the_key() {
        let query = q(vec![
            ("tag", vec!["a", "b"].into()),
            ("page", 2u64.into()),
            ("archived", false.into()),
        ]);
        let url = build_url("https://api.test", "/items", &query).unwrap();
        assert_eq!(url.query(), Some("tag=a&tag=b&page=2&archived=false"));
    }

    #[test]
    fn absent_and_empty_values_are_skipped() {
        let query = q(vec![
            ("missing", None::<&str>.into()),
            ("empty", Vec::<String>::new().into()),
        ]);
        let url = build_url("https://api.test", "/items", &query).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn values_are_percent_encoded() {
        let query = q(vec![("q", "a b&c".into())]);
        let url = build_url("https://api.test", "/search", &query).unwrap();
        assert_eq!(url.query(), Some("q=a+b%26c"));
    }

    #[test]
    fn invalid_url_is_client_error() {
        let err = build_url("not a url", "/x", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);
    }

    #[test]
    fn builder_sets_fields() {
        let options = RequestOptions::new()
            .timeout(Duration::from_secs(2))
            .skip_auth()
            .skip_queue()
            .no_retry()
            .priority(Priority::High)
            .query("k", "v");
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert!(options.skip_auth && options.skip_queue);
        assert_eq!(options.retry, RetrySetting::Disabled);
        assert_eq!(options.priority, Some(Priority::High));
        assert_eq!(options.query.len(), 1);
    }
}
