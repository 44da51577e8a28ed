//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens come only from API_ACCESS_TOKEN / API_REFRESH_TOKEN or the
//! credential file, never from the TOML, so they can't leak through it.

use api_client::ClientConfig;
use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "api-probe.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub credentials: CredentialsConfig,
    pub probe: ProbeConfig,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
}

/// Where tokens persist between runs. Without a path they live in memory.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: Option<PathBuf>,
}

/// TCP connectivity probe. Without an address the device is assumed online.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub addr: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            addr: None,
            timeout_ms: 3000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Defaults plus environment overlays, for runs without a config file.
    pub fn from_env() -> common::Result<Self> {
        Config::default().finish()
    }

    /// Load `path` if it exists. A missing file is only an error when the
    /// path was asked for explicitly.
    pub fn load_or_default(path: &Path, explicit: bool) -> common::Result<Self> {
        if explicit || path.exists() {
            Config::load(path)
        } else {
            Config::from_env()
        }
    }

    fn finish(mut self) -> common::Result<Self> {
        self.apply_env();
        self.validate()?;
        Ok(self)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("API_BASE_URL") {
            if !url.trim().is_empty() {
                self.client.base_url = url.trim().to_string();
            }
        }
        self.access_token = secret_from_env("API_ACCESS_TOKEN");
        self.refresh_token = secret_from_env("API_REFRESH_TOKEN");
    }

    fn validate(&self) -> common::Result<()> {
        self.client.validate()?;
        if self.probe.addr.is_some() && self.probe.timeout_ms == 0 {
            return Err(common::Error::invalid(
                "probe.timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.probe.addr.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(common::Error::invalid("probe.addr", "must not be empty"));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Whether the path came from the user rather than the default.
    pub fn path_is_explicit(cli_path: Option<&str>) -> bool {
        cli_path.is_some() || std::env::var_os("CONFIG_PATH").is_some()
    }
}

fn secret_from_env(key: &str) -> Option<Secret<String>> {
    std::env::var(key)
        .ok()
        .map(Secret::new)
        .filter(|s| !s.is_blank())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_env() {
        for key in [
            "API_BASE_URL",
            "API_ACCESS_TOKEN",
            "API_REFRESH_TOKEN",
            "CONFIG_PATH",
        ] {
            unsafe { remove_env(key) };
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-probe.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    const VALID: &str = r#"
[client]
base_url = "https://api.example.com"
max_concurrent = 2

[client.refresh]
cooldown_ms = 500

[credentials]
path = "/var/lib/api-probe/credentials.json"

[probe]
addr = "api.example.com:443"
"#;

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(VALID);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.client.base_url, "https://api.example.com");
        assert_eq!(config.client.max_concurrent, 2);
        assert_eq!(config.client.timeout_ms, 15_000);
        assert_eq!(config.client.refresh.cooldown_ms, 500);
        assert_eq!(
            config.credentials.path,
            Some(PathBuf::from("/var/lib/api-probe/credentials.json"))
        );
        assert_eq!(config.probe.addr.as_deref(), Some("api.example.com:443"));
        assert_eq!(config.probe.timeout(), Duration::from_secs(3));
        assert!(config.access_token.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/api-probe.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config("[client]\nbase_url = \"api.example.com\"\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("base_url"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_probe_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config("[probe]\naddr = \"localhost:80\"\ntimeout_ms = 0\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overlays() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(VALID);

        unsafe { set_env("API_BASE_URL", "http://localhost:4000") };
        unsafe { set_env("API_ACCESS_TOKEN", "at-env") };
        unsafe { set_env("API_REFRESH_TOKEN", "  ") };
        let config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(config.client.base_url, "http://localhost:4000");
        assert_eq!(config.access_token.as_ref().unwrap().expose(), "at-env");
        assert!(config.refresh_token.is_none(), "blank tokens are ignored");
        assert_eq!(format!("{:?}", config.access_token), "Some([REDACTED])");
    }

    #[test]
    fn test_missing_default_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = Config::load_or_default(&path, false).unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert!(config.credentials.path.is_none());
        assert!(Config::load_or_default(&path, true).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert!(Config::path_is_explicit(None));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/path.toml"));
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("api-probe.toml"));
        assert!(!Config::path_is_explicit(None));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
    }
}
