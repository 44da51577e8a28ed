//! api-probe
//!
//! Command line driver for the resilient API client:
//! 1. Loads configuration (TOML file + env overlays)
//! 2. Seeds the credential store from env or a credential file
//! 3. Issues N concurrent copies of one request through a single client
//! 4. Prints bodies to stdout and structured errors to stderr

mod cli;
mod config;
mod metrics;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use api_client::{ApiClient, ApiError};
use clap::Parser;
use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use serde_json::{Value, json};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{AlwaysOnline, ConnectivityProbe, TcpProbe};

use crate::cli::Args;
use crate::config::Config;

/// Upper bound on waiting for a background token refresh before exit.
const REFRESH_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // JSON logs on stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();

    let prometheus = if args.metrics {
        Some(metrics::install_recorder().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let config_path = Config::resolve_path(args.config.as_deref());
    let explicit = Config::path_is_explicit(args.config.as_deref());
    info!(path = %config_path.display(), explicit, "loading configuration");
    let config = Config::load_or_default(&config_path, explicit)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.client.base_url,
        max_concurrent = config.client.max_concurrent,
        credentials = ?config.credentials.path,
        probe = ?config.probe.addr,
        "configuration loaded"
    );

    let client = build_client(config).await?;

    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    let failures = run_requests(&client, &args, &mut stdout.lock(), &mut stderr.lock()).await?;

    // Let a refresh triggered by the run persist its rotated tokens.
    client
        .refresh_coordinator()
        .wait_for_active_refresh(REFRESH_DRAIN)
        .await;

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }

    if failures > 0 {
        error!(failures, total = args.repeat, "run finished with failures");
        Ok(ExitCode::FAILURE)
    } else {
        info!(total = args.repeat, "run finished");
        Ok(ExitCode::SUCCESS)
    }
}

/// Wire the client's collaborators from configuration.
async fn build_client(config: Config) -> Result<ApiClient> {
    let store: Arc<dyn CredentialStore> = match &config.credentials.path {
        Some(path) => Arc::new(
            FileCredentialStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load credentials from {}", path.display()))?,
        ),
        None => Arc::new(MemoryCredentialStore::new()),
    };

    match (&config.access_token, &config.refresh_token) {
        (Some(access), refresh) => {
            credentials::store_tokens(
                store.as_ref(),
                access.expose(),
                refresh.as_ref().map(|r| r.expose().as_str()),
            )
            .await
            .context("failed to seed tokens")?;
        }
        (None, Some(refresh)) => {
            store
                .set(credentials::REFRESH_TOKEN_KEY, refresh.expose().clone())
                .await
                .context("failed to seed refresh token")?;
        }
        (None, None) => {}
    }

    let probe: Arc<dyn ConnectivityProbe> = match &config.probe.addr {
        Some(addr) => Arc::new(TcpProbe::new(addr.clone(), config.probe.timeout())),
        None => Arc::new(AlwaysOnline),
    };

    ApiClient::builder(config.client)
        .credential_store(store)
        .probe(probe)
        .build()
        .context("invalid client configuration")
}

/// Run `args.repeat` concurrent copies of the request. Bodies go to `out`
/// one JSON document per line, failures to `err`. Returns the failure count.
async fn run_requests<O: Write, E: Write>(
    client: &ApiClient,
    args: &Args,
    out: &mut O,
    err: &mut E,
) -> Result<usize> {
    let options = args.request_options();
    let handles: Vec<_> = (0..args.repeat)
        .map(|_| {
            let client = client.clone();
            let method = args.method.clone();
            let endpoint = args.endpoint.clone();
            let data = args.data.clone();
            let options = options.clone();
            tokio::spawn(async move {
                client
                    .request::<Value, Value>(method, &endpoint, data.as_ref(), options)
                    .await
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        let result = handle
            .await
            .unwrap_or_else(|e| Err(ApiError::network(format!("request task failed: {e}"))));
        match result {
            Ok(body) => writeln!(out, "{}", serde_json::to_string(&body)?)?,
            Err(e) => {
                failures += 1;
                writeln!(err, "{}", serde_json::to_string(&error_document(&e))?)?;
            }
        }
    }
    Ok(failures)
}

fn error_document(e: &ApiError) -> Value {
    json!({
        "error": {
            "status": e.status,
            "kind": e.kind,
            "message": e.message,
            "payload": e.payload,
        }
    })
}
