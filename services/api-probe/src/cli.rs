//! Command line definition

use api_client::{Priority, RequestOptions};
use clap::{ArgAction, Parser};
use serde_json::Value;
use transport::Method;

/// Issue concurrent copies of one request through the resilient API client.
#[derive(Parser, Debug, Clone)]
#[command(name = "api-probe", version, about, long_about = None)]
pub struct Args {
    /// Path to config file (falls back to CONFIG_PATH, then api-probe.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Print Prometheus metrics to stderr after the run
    #[arg(long)]
    pub metrics: bool,

    /// Send without an Authorization header
    #[arg(long)]
    pub skip_auth: bool,

    /// Bypass the admission queue
    #[arg(long)]
    pub skip_queue: bool,

    /// Single attempt, no retries
    #[arg(long)]
    pub no_retry: bool,

    /// Admission priority: high, normal or low
    #[arg(long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Concurrent copies of the request
    #[arg(long, default_value_t = 1, value_parser = parse_repeat)]
    pub repeat: usize,

    /// Query parameter as key=value; repeat for multi-valued keys
    #[arg(long = "query", value_name = "KEY=VALUE", value_parser = parse_query, action = ArgAction::Append)]
    pub query: Vec<(String, String)>,

    /// JSON request body
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    pub data: Option<Value>,

    /// HTTP method
    #[arg(value_parser = parse_method)]
    pub method: Method,

    /// Endpoint path relative to the base URL
    pub endpoint: String,
}

impl Args {
    /// Per-request options for every copy of the request.
    pub fn request_options(&self) -> RequestOptions {
        let mut options = RequestOptions::new();
        if self.skip_auth {
            options = options.skip_auth();
        }
        if self.skip_queue {
            options = options.skip_queue();
        }
        if self.no_retry {
            options = options.no_retry();
        }
        if let Some(priority) = self.priority {
            options = options.priority(priority);
        }
        for (key, val) in &self.query {
            options = options.query(key.clone(), val.clone());
        }
        options
    }
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    raw.parse::<Priority>()
}

fn parse_repeat(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err("expected a positive integer".to_string()),
    }
}

fn parse_query(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, val)| (key.to_string(), val.to_string()))
        .ok_or_else(|| "expected key=value".to_string())
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str::<Value>(raw).map_err(|e| format!("not JSON: {e}"))
}

fn parse_method(raw: &str) -> Result<Method, String> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("not an HTTP method: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::{QueryValue, RetrySetting};
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("api-probe").chain(args.iter().copied()))
    }

    #[test]
    fn minimal_invocation() {
        let args = parse(&["get", "/users/me"]).unwrap();
        assert_eq!(args.method, Method::GET);
        assert_eq!(args.endpoint, "/users/me");
        assert_eq!(args.repeat, 1);
        assert!(!args.metrics && !args.skip_auth && !args.skip_queue && !args.no_retry);
        assert!(args.query.is_empty());
        assert!(args.data.is_none());
    }

    #[test]
    fn every_flag() {
        let args = parse(&[
            "--config",
            "custom.toml",
            "--metrics",
            "--skip-auth",
            "--skip-queue",
            "--no-retry",
            "--priority",
            "HIGH",
            "--repeat",
            "8",
            "--query",
            "tag=a",
            "--query",
            "tag=b",
            "--data",
            r#"{"name":"x"}"#,
            "POST",
            "/items",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("custom.toml"));
        assert!(args.metrics && args.skip_auth && args.skip_queue && args.no_retry);
        assert_eq!(args.priority, Some(Priority::High));
        assert_eq!(args.repeat, 8);
        assert_eq!(args.data, Some(serde_json::json!({ "name": "x" })));
        assert_eq!(args.method, Method::POST);

        let options = args.request_options();
        assert!(options.skip_auth && options.skip_queue);
        assert_eq!(options.retry, RetrySetting::Disabled);
        assert_eq!(options.priority, Some(Priority::High));
        assert_eq!(
            options.query,
            vec![
                ("tag".to_string(), QueryValue::Scalar("a".into())),
                ("tag".to_string(), QueryValue::Scalar("b".into())),
            ]
        );
    }

    #[test]
    fn query_values_may_contain_equals() {
        let args = parse(&["--query", "filter=a=b", "GET", "/x"]).unwrap();
        assert_eq!(args.query, vec![("filter".to_string(), "a=b".to_string())]);
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert_eq!(parse(&["GET", "-h"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn rejects_bad_input() {
        let kind = |args: &[&str]| parse(args).unwrap_err().kind();

        assert_eq!(kind(&["--bogus", "GET", "/x"]), ErrorKind::UnknownArgument);
        assert_eq!(kind(&["GET", "/x", "--repeat"]), ErrorKind::InvalidValue);
        assert_eq!(kind(&["--repeat", "0", "GET", "/x"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["--priority", "urgent", "GET", "/x"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["--query", "novalue", "GET", "/x"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["--data", "{oops", "POST", "/x"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["GET"]), ErrorKind::MissingRequiredArgument);
        assert_eq!(kind(&[]), ErrorKind::MissingRequiredArgument);
        assert_eq!(kind(&["GET", "/x", "/y"]), ErrorKind::UnknownArgument);
    }

    #[test]
    fn definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
