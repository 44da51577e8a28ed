//! Credential refresh coordinator
//!
//! Exchanges the stored refresh token for a new access token, with two
//! layers of protection for the auth server:
//!
//! - single-flight: concurrent callers holding the same refresh token share
//!   one network exchange and observe the same outcome
//! - cooldown: a new exchange is not started within `cooldown_ms` of the
//!   previous one unless forced
//!
//! Inside one exchange a bounded loop absorbs transient failures: 429 waits
//! `max(Retry-After, rate_limit_backoff_ms)`, network errors and 5xx back off
//! linearly. A 401 means the refresh token is dead: stored tokens are cleared
//! and no further attempts are made.
//!
//! Every failure is reported as a `RefreshOutcome`, never as an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use credentials::{CredentialStore, RefreshRequest, TokenResponse};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::{HeaderValue, Method, Transport, TransportRequest, TransportResponse, Url, header};

use crate::metrics;
use crate::retry_after::retry_after_header;

/// Why a refresh produced (or did not produce) a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Success,
    NoRefreshToken,
    RefreshTokenInvalid,
    NetworkError,
    Cooldown,
    RateLimited,
    UnknownError,
}

impl RefreshReason {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshReason::Success => "success",
            RefreshReason::NoRefreshToken => "no_refresh_token",
            RefreshReason::RefreshTokenInvalid => "refresh_token_invalid",
            RefreshReason::NetworkError => "network_error",
            RefreshReason::Cooldown => "cooldown",
            RefreshReason::RateLimited => "rate_limited",
            RefreshReason::UnknownError => "unknown_error",
        }
    }
}

/// Result of one `refresh()` call.
///
/// `token` is set only when `reason` is `Success`. `retry_after` is set for
/// `Cooldown` and `RateLimited`.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub token: Option<String>,
    pub reason: RefreshReason,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RefreshOutcome {
    fn success(token: String) -> Self {
        Self {
            token: Some(token),
            reason: RefreshReason::Success,
            error: None,
            retry_after: None,
        }
    }

    fn failed(reason: RefreshReason, error: Option<String>, retry_after: Option<Duration>) -> Self {
        Self {
            token: None,
            reason,
            error,
            retry_after,
        }
    }
}

impl fmt::Debug for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshOutcome")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("reason", &self.reason)
            .field("error", &self.error)
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

/// Refresh endpoint and pacing. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Path (relative to the API base URL) or absolute URL.
    pub endpoint: String,
    /// Minimum spacing between exchanges unless forced.
    pub cooldown_ms: u64,
    /// Network attempts inside one exchange.
    pub max_attempts: u32,
    /// Floor for the wait after a 429 from the refresh endpoint.
    pub rate_limit_backoff_ms: u64,
    /// Linear backoff unit after network errors and 5xx.
    pub network_backoff_ms: u64,
    /// Deadline for each refresh call.
    pub timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            endpoint: "/auth/refresh".into(),
            cooldown_ms: 2000,
            max_attempts: 3,
            rate_limit_backoff_ms: 4000,
            network_backoff_ms: 1000,
            timeout_ms: 5000,
        }
    }
}

impl RefreshConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn network_backoff(&self) -> Duration {
        Duration::from_millis(self.network_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Why one exchange failed. Translated into `RefreshOutcome` for callers.
#[derive(Debug, Clone)]
enum RefreshFailure {
    Invalid,
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    Network(String),
    Http {
        status: u16,
        message: String,
    },
    Malformed(String),
    Aborted(String),
}

impl RefreshFailure {
    fn into_outcome(self, config: &RefreshConfig) -> RefreshOutcome {
        match self {
            RefreshFailure::Invalid => RefreshOutcome::failed(
                RefreshReason::RefreshTokenInvalid,
                Some("refresh token rejected".into()),
                None,
            ),
            RefreshFailure::RateLimited {
                message,
                retry_after,
            } => RefreshOutcome::failed(
                RefreshReason::RateLimited,
                Some(message),
                Some(retry_after.unwrap_or_else(|| config.rate_limit_backoff())),
            ),
            RefreshFailure::Network(message) => {
                RefreshOutcome::failed(RefreshReason::NetworkError, Some(message), None)
            }
            RefreshFailure::Http { status, message } => RefreshOutcome::failed(
                RefreshReason::UnknownError,
                Some(format!("refresh failed with status {status}: {message}")),
                None,
            ),
            RefreshFailure::Malformed(message) | RefreshFailure::Aborted(message) => {
                RefreshOutcome::failed(RefreshReason::UnknownError, Some(message), None)
            }
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

#[derive(Default)]
struct State {
    /// Keyed by refresh token value; rotation yields a new key.
    in_flight: HashMap<String, InFlight>,
    last_attempt: Option<Instant>,
    next_id: u64,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one exchange needs, owned so it can run on a spawned task.
#[derive(Clone)]
struct Exchange {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    url: Url,
    config: RefreshConfig,
}

impl Exchange {
    /// Bounded attempt loop.
    async fn run(&self, refresh_token: &str) -> Result<String, RefreshFailure> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let failure = match self.send(refresh_token).await {
                Ok(token) => return Ok(token),
                Err(failure) => failure,
            };
            if attempt >= max_attempts {
                warn!(attempt, ?failure, "refresh attempts exhausted");
                return Err(failure);
            }

            let delay = match &failure {
                RefreshFailure::RateLimited { retry_after, .. } => retry_after
                    .unwrap_or_default()
                    .max(self.config.rate_limit_backoff()),
                RefreshFailure::Network(_) => self.config.network_backoff() * attempt,
                RefreshFailure::Http { status, .. } if *status >= 500 => {
                    self.config.network_backoff() * attempt
                }
                _ => return Err(failure),
            };
            warn!(
                attempt,
                ?failure,
                delay_ms = delay.as_millis() as u64,
                "refresh attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send(&self, refresh_token: &str) -> Result<String, RefreshFailure> {
        let body = serde_json::to_vec(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
        let mut request = TransportRequest::new(Method::POST, self.url.clone());
        request.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        request.body = Some(body);

        let timeout = self.config.timeout();
        let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RefreshFailure::Network(e.to_string())),
            Err(_) => {
                return Err(RefreshFailure::Network(format!(
                    "refresh timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        match response.status {
            200..=299 => {
                let token: TokenResponse = serde_json::from_str(&response.body)
                    .map_err(|e| RefreshFailure::Malformed(format!("invalid refresh response: {e}")))?;
                if token.access_token.is_empty() {
                    return Err(RefreshFailure::Malformed(
                        "refresh response has an empty access token".into(),
                    ));
                }
                if let Err(e) = credentials::store_tokens(
                    self.store.as_ref(),
                    &token.access_token,
                    token.refresh_token.as_deref(),
                )
                .await
                {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }
                info!(rotated = token.refresh_token.is_some(), "access token refreshed");
                Ok(token.access_token)
            }
            401 => {
                warn!("refresh token rejected, clearing stored tokens");
                if let Err(e) = credentials::clear_tokens(self.store.as_ref()).await {
                    warn!(error = %e, "failed to clear stored tokens");
                }
                Err(RefreshFailure::Invalid)
            }
            429 => Err(RefreshFailure::RateLimited {
                message: server_message(&response),
                retry_after: retry_after_header(&response),
            }),
            status => Err(RefreshFailure::Http {
                status,
                message: server_message(&response),
            }),
        }
    }
}

fn server_message(response: &TransportResponse) -> String {
    serde_json::from_str::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP error {}", response.status))
}

/// Single-flight, cooldown-guarded access token refresh.
///
/// Construct once and share (`Arc`) with every executor that needs it.
pub struct RefreshCoordinator {
    exchange: Exchange,
    state: Arc<Mutex<State>>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        refresh_url: Url,
        config: RefreshConfig,
    ) -> Self {
        Self {
            exchange: Exchange {
                transport,
                store,
                url: refresh_url,
                config,
            },
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.exchange.config
    }

    /// Obtain a fresh access token.
    ///
    /// Joins an exchange already in flight for the stored refresh token.
    /// Otherwise starts one, unless the previous exchange started less than
    /// `cooldown_ms` ago and `force` is false. `force` skips only the
    /// cooldown; it never starts a second exchange for the same token.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        let outcome = self.refresh_inner(force).await;
        metrics::record_refresh(outcome.reason.label());
        debug!(?outcome, force, "refresh finished");
        outcome
    }

    async fn refresh_inner(&self, force: bool) -> RefreshOutcome {
        let refresh_token = match credentials::refresh_token(self.exchange.store.as_ref()).await {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                return RefreshOutcome::failed(
                    RefreshReason::NoRefreshToken,
                    Some("no refresh token stored".into()),
                    None,
                );
            }
            Err(e) => {
                return RefreshOutcome::failed(
                    RefreshReason::UnknownError,
                    Some(format!("reading refresh token: {e}")),
                    None,
                );
            }
        };

        let future = {
            let mut state = lock(&self.state);
            if let Some(entry) = state.in_flight.get(&refresh_token) {
                debug!("joining in-flight refresh");
                entry.future.clone()
            } else {
                let cooldown = self.exchange.config.cooldown();
                if let Some(last) = state.last_attempt.filter(|_| !force) {
                    let elapsed = last.elapsed();
                    if elapsed < cooldown {
                        debug!(elapsed_ms = elapsed.as_millis() as u64, "refresh in cooldown");
                        return RefreshOutcome::failed(
                            RefreshReason::Cooldown,
                            Some("refresh attempted too recently".into()),
                            Some(cooldown - elapsed),
                        );
                    }
                }
                state.last_attempt = Some(Instant::now());
                let id = state.next_id;
                state.next_id += 1;
                let future = self.spawn_exchange(refresh_token.clone(), id);
                state.in_flight.insert(
                    refresh_token,
                    InFlight {
                        id,
                        future: future.clone(),
                    },
                );
                future
            }
        };

        match future.await {
            Ok(token) => RefreshOutcome::success(token),
            Err(failure) => failure.into_outcome(&self.exchange.config),
        }
    }

    /// Run the exchange on its own task so it completes (and leaves the
    /// in-flight map) even if every caller is dropped.
    fn spawn_exchange(&self, refresh_token: String, id: u64) -> SharedRefresh {
        let exchange = self.exchange.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let result = exchange.run(&refresh_token).await;
            let mut state = lock(&state);
            if state.in_flight.get(&refresh_token).is_some_and(|e| e.id == id) {
                state.in_flight.remove(&refresh_token);
            }
            result
        });
        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(RefreshFailure::Aborted(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Whether any exchange is currently in flight.
    pub fn is_refresh_in_progress(&self) -> bool {
        !lock(&self.state).in_flight.is_empty()
    }

    /// Wait until every in-flight exchange settles, or `max_wait` elapses.
    pub async fn wait_for_active_refresh(&self, max_wait: Duration) {
        let pending: Vec<SharedRefresh> = lock(&self.state)
            .in_flight
            .values()
            .map(|entry| entry.future.clone())
            .collect();
        if pending.is_empty() {
            return;
        }
        if tokio::time::timeout(max_wait, join_all(pending)).await.is_err() {
            debug!(max_wait_ms = max_wait.as_millis() as u64, "gave up waiting for refresh");
        }
    }
}
