//! Client configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Pattern tables are ordered lists: the first rule whose pattern
//! is a substring of the endpoint wins.

use std::time::Duration;

use resilience::{Priority, RefreshConfig, RetryPolicy};
use serde::Deserialize;

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for relative endpoints. Must be http(s).
    pub base_url: String,
    /// Default per-request deadline.
    pub timeout_ms: u64,
    /// Admission queue slots.
    pub max_concurrent: usize,
    /// Base delay for queue pacing under backlog.
    pub pacing_base_ms: u64,
    /// Refresh rounds the executor will drive for one 401.
    pub max_auth_refresh_attempts: u32,
    pub retry: RetryPolicy,
    pub refresh: RefreshConfig,
    /// Endpoints (substring match) that bypass the admission queue.
    pub direct_endpoints: Vec<String>,
    pub endpoint_timeouts: Vec<TimeoutRule>,
    pub priorities: Vec<PriorityRule>,
}

/// Deadline override for endpoints containing `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutRule {
    pub pattern: String,
    pub timeout_ms: u64,
}

/// Queue priority for endpoints containing `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriorityRule {
    pub pattern: String,
    pub priority: Priority,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            timeout_ms: 15_000,
            max_concurrent: resilience::queue::DEFAULT_MAX_CONCURRENT,
            pacing_base_ms: resilience::queue::DEFAULT_PACING_BASE.as_millis() as u64,
            max_auth_refresh_attempts: 3,
            retry: RetryPolicy::default(),
            refresh: RefreshConfig::default(),
            direct_endpoints: vec!["/auth/refresh".into(), "/auth/login".into()],
            endpoint_timeouts: Vec::new(),
            priorities: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Reject values the executor cannot run with.
    pub fn validate(&self) -> common::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "base_url",
                format!("must start with http:// or https://, got: {}", self.base_url),
            ));
        }
        if let Err(e) = transport::Url::parse(&self.base_url) {
            return Err(common::Error::invalid("base_url", e.to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(common::Error::invalid("timeout_ms", "must be greater than 0"));
        }
        if self.max_concurrent == 0 {
            return Err(common::Error::invalid(
                "max_concurrent",
                "must be greater than 0",
            ));
        }
        if self.max_auth_refresh_attempts == 0 {
            return Err(common::Error::invalid(
                "max_auth_refresh_attempts",
                "must be greater than 0",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(common::Error::invalid(
                "retry.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.refresh.max_attempts == 0 {
            return Err(common::Error::invalid(
                "refresh.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.refresh.timeout_ms == 0 {
            return Err(common::Error::invalid(
                "refresh.timeout_ms",
                "must be greater than 0",
            ));
        }
        if let Some(rule) = self.endpoint_timeouts.iter().find(|r| r.timeout_ms == 0) {
            return Err(common::Error::invalid(
                "endpoint_timeouts",
                format!("timeout for `{}` must be greater than 0", rule.pattern),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pacing_base(&self) -> Duration {
        Duration::from_millis(self.pacing_base_ms)
    }

    /// Deadline for `endpoint`: first matching rule, else the default.
    pub fn timeout_for(&self, endpoint: &str) -> Duration {
        self.endpoint_timeouts
            .iter()
            .find(|rule| endpoint.contains(&rule.pattern))
            .map(|rule| Duration::from_millis(rule.timeout_ms))
            .unwrap_or_else(|| self.default_timeout())
    }

    /// Queue priority for `endpoint`: first matching rule, else `Normal`.
    pub fn priority_for(&self, endpoint: &str) -> Priority {
        self.priorities
            .iter()
            .find(|rule| endpoint.contains(&rule.pattern))
            .map(|rule| rule.priority)
            .unwrap_or_default()
    }

    /// Whether `endpoint` is an auth route that skips the queue.
    pub fn is_direct(&self, endpoint: &str) -> bool {
        self.direct_endpoints
            .iter()
            .any(|pattern| endpoint.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> ClientConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout_ms, 15_000);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.pacing_base_ms, 50);
        assert_eq!(config.max_auth_refresh_attempts, 3);
        assert_eq!(config.refresh.cooldown_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let config = parse(
            r#"
base_url = "https://api.example.com"
max_concurrent = 8

[retry]
max_attempts = 5

[[endpoint_timeouts]]
pattern = "/reports"
timeout_ms = 60000

[[priorities]]
pattern = "/notifications"
priority = "low"
"#,
        );
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.timeout_ms, 15_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.refresh.endpoint, "/auth/refresh");
        assert_eq!(config.priority_for("/notifications/unread"), Priority::Low);
    }

    #[test]
    fn timeout_table_first_match_wins() {
        let config = ClientConfig {
            endpoint_timeouts: vec![
                TimeoutRule {
                    pattern: "/reports/export".into(),
                    timeout_ms: 120_000,
                },
                TimeoutRule {
                    pattern: "/reports".into(),
                    timeout_ms: 60_000,
                },
            ],
            ..ClientConfig::default()
        };
        assert_eq!(
            config.timeout_for("/reports/export?year=2024"),
            Duration::from_secs(120)
        );
        assert_eq!(config.timeout_for("/reports/daily"), Duration::from_secs(60));
        assert_eq!(config.timeout_for("/users"), Duration::from_secs(15));
    }

    #[test]
    fn direct_endpoints_match_auth_routes() {
        let config = ClientConfig::default();
        assert!(config.is_direct("/auth/refresh"));
        assert!(config.is_direct("/auth/login"));
        assert!(!config.is_direct("/users/me"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = ClientConfig::new("api.example.com").validate().unwrap_err();
        assert!(err.to_string().contains("base_url"), "got: {err}");
    }

    #[test]
    fn rejects_zero_values() {
        let zero_timeout = ClientConfig {
            timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_slots = ClientConfig {
            max_concurrent: 0,
            ..ClientConfig::default()
        };
        assert!(zero_slots.validate().is_err());

        let mut zero_retry = ClientConfig::default();
        zero_retry.retry.max_attempts = 0;
        assert!(zero_retry.validate().is_err());

        let zero_rule = ClientConfig {
            endpoint_timeouts: vec![TimeoutRule {
                pattern: "/x".into(),
                timeout_ms: 0,
            }],
            ..ClientConfig::default()
        };
        let err = zero_rule.validate().unwrap_err();
        assert!(err.to_string().contains("/x"));
    }
}
