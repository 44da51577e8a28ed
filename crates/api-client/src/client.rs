//! Request executor
//!
//! Builds the wire request, enforces the deadline, routes through the
//! admission queue and retry engine, and recovers from 401 by driving the
//! refresh coordinator before re-issuing the request exactly once.
//!
//! Routing:
//! - auth routes (`direct_endpoints`) and `skip_queue` requests run straight
//!   under `with_retry`
//! - everything else is admitted through the queue first, and retries run
//!   inside the queued task so a retrying request keeps its slot

use std::sync::Arc;
use std::time::Duration;

use credentials::{CredentialStore, MemoryCredentialStore};
use resilience::metrics;
use resilience::{
    AdmissionQueue, ApiError, ErrorKind, RefreshCoordinator, RefreshReason, RetryPolicy,
    retry_after_header, with_retry,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use transport::{
    AlwaysOnline, ConnectivityProbe, HeaderMap, HeaderValue, Method, ReqwestTransport, StatusCode,
    Transport, TransportRequest, TransportResponse, Url, header,
};

use crate::config::ClientConfig;
use crate::fallback::OfflineFallbacks;
use crate::options::{RequestOptions, RetrySetting, build_url};

/// Retry hint assumed when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(60);

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    probe: Arc<dyn ConnectivityProbe>,
    refresh: Arc<RefreshCoordinator>,
    queue: AdmissionQueue,
    fallbacks: OfflineFallbacks,
}

impl Inner {
    async fn current_token(&self) -> Option<String> {
        match credentials::access_token(self.store.as_ref()).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to read access token");
                None
            }
        }
    }
}

/// Resilient JSON API client.
///
/// Cheap to clone; clones share the queue, refresh state and credentials.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

/// Builder for [`ApiClient`]. Unset collaborators fall back to a reqwest
/// transport, an in-memory credential store and an always-online probe.
pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn CredentialStore>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    refresh: Option<Arc<RefreshCoordinator>>,
    fallbacks: OfflineFallbacks,
}

impl ApiClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share a coordinator between clients. By default each client builds
    /// its own from `config.refresh`.
    pub fn refresh_coordinator(mut self, refresh: Arc<RefreshCoordinator>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn fallbacks(mut self, fallbacks: OfflineFallbacks) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn build(self) -> common::Result<ApiClient> {
        self.config.validate()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::default()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let probe = self.probe.unwrap_or_else(|| Arc::new(AlwaysOnline));

        let refresh = match self.refresh {
            Some(refresh) => refresh,
            None => {
                let url = build_url(&self.config.base_url, &self.config.refresh.endpoint, &[])
                    .map_err(|e| common::Error::invalid("refresh.endpoint", e.message))?;
                Arc::new(RefreshCoordinator::new(
                    Arc::clone(&transport),
                    Arc::clone(&store),
                    url,
                    self.config.refresh.clone(),
                ))
            }
        };

        let queue = AdmissionQueue::new(self.config.max_concurrent, self.config.pacing_base());

        info!(
            base_url = %self.config.base_url,
            max_concurrent = self.config.max_concurrent,
            timeout_ms = self.config.timeout_ms,
            "api client ready"
        );

        Ok(ApiClient {
            inner: Arc::new(Inner {
                config: self.config,
                transport,
                store,
                probe,
                refresh,
                queue,
                fallbacks: self.fallbacks,
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            transport: None,
            store: None,
            probe: None,
            refresh: None,
            fallbacks: OfflineFallbacks::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.refresh
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::GET, endpoint, None, options)
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request(Method::POST, endpoint, body, options)
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request(Method::PUT, endpoint, body, options)
            .await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request(Method::PATCH, endpoint, body, options)
            .await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::DELETE, endpoint, None, options)
            .await
    }

    /// Issue a request with an optional JSON body and decode the response.
    ///
    /// An empty success body decodes from JSON `null`, so `()` and
    /// `Option<_>` both accept it.
    pub async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| {
                ApiError::new(format!("Invalid request body: {e}"), 400, ErrorKind::Client)
            })?;

        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let span = info_span!("api_request", request_id = %request_id, %method, endpoint);
        let value = self
            .execute(method, endpoint, body, options)
            .instrument(span)
            .await?;
        serde_json::from_value(value).map_err(|e| ApiError::parse(200, e))
    }

    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let inner = &self.inner;
        let config = &inner.config;

        if let Some(hook) = inner.fallbacks.find(endpoint) {
            if !inner.probe.check().await.connected {
                info!("offline, serving fallback");
                return hook(endpoint, &method);
            }
        }

        let url = build_url(&config.base_url, endpoint, &options.query)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| config.timeout_for(endpoint));
        let policy = match options.retry {
            RetrySetting::Default => config.retry.clone(),
            RetrySetting::Disabled => RetryPolicy::default().with_max_attempts(1),
            RetrySetting::Custom(policy) => policy,
        };

        let call = Call {
            inner: Arc::clone(inner),
            method,
            url,
            headers: options.headers,
            body,
            timeout,
            skip_auth: options.skip_auth,
        };

        if options.skip_queue || config.is_direct(endpoint) {
            debug!("bypassing admission queue");
            return call.run(&policy).await;
        }

        let priority = options
            .priority
            .unwrap_or_else(|| config.priority_for(endpoint));
        let span = tracing::Span::current();
        inner
            .queue
            .enqueue(
                async move { call.run(&policy).await }.instrument(span),
                priority,
            )
            .await
    }

    /// Requests waiting for an admission slot.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    /// Requests holding an admission slot.
    pub fn active_count(&self) -> usize {
        self.inner.queue.active_count()
    }

    /// Cancel every request still waiting for a slot. In-flight requests
    /// are unaffected. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.inner.queue.clear();
        if cancelled > 0 {
            info!(cancelled, "cancelled pending requests");
        }
        cancelled
    }

    /// Store a new session.
    pub async fn set_tokens(&self, access: &str, refresh: Option<&str>) -> credentials::Result<()> {
        credentials::store_tokens(self.inner.store.as_ref(), access, refresh).await
    }

    /// Sign out locally.
    pub async fn clear_tokens(&self) -> credentials::Result<()> {
        credentials::clear_tokens(self.inner.store.as_ref()).await
    }

    pub async fn access_token(&self) -> credentials::Result<Option<String>> {
        credentials::access_token(self.inner.store.as_ref()).await
    }
}

/// One request, owned so it can run inside a queued task.
struct Call {
    inner: Arc<Inner>,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    timeout: Duration,
    skip_auth: bool,
}

impl Call {
    async fn run(&self, policy: &RetryPolicy) -> Result<Value, ApiError> {
        with_retry(policy, self.inner.probe.as_ref(), || self.attempt()).await
    }

    async fn attempt(&self) -> Result<Value, ApiError> {
        let token = if self.skip_auth {
            None
        } else {
            self.inner.current_token().await
        };

        let response = self.send(token.as_deref()).await?;
        if response.status == 401 && !self.skip_auth {
            return self.recover_unauthorized(token).await;
        }
        interpret(response)
    }

    /// Drive the refresh coordinator after a 401 and re-issue once.
    async fn recover_unauthorized(&self, rejected: Option<String>) -> Result<Value, ApiError> {
        let config = &self.inner.config;
        let rounds = config.max_auth_refresh_attempts.max(1);

        for round in 1..=rounds {
            let outcome = self.inner.refresh.refresh(false).await;
            match outcome.reason {
                RefreshReason::Success => {
                    if let Some(token) = outcome.token {
                        info!(round, "re-issuing request with refreshed token");
                        return interpret(self.send(Some(&token)).await?);
                    }
                }
                RefreshReason::Cooldown => {
                    // Another request refreshed moments ago; its token is usable.
                    if let Some(current) = self.inner.current_token().await {
                        if rejected.as_deref() != Some(current.as_str()) {
                            info!(round, "re-issuing request with recently refreshed token");
                            return interpret(self.send(Some(&current)).await?);
                        }
                    }
                    let wait = outcome
                        .retry_after
                        .unwrap_or_else(|| config.refresh.cooldown());
                    warn!(round, wait_ms = wait.as_millis() as u64, "refresh in cooldown, waiting");
                    tokio::time::sleep(wait).await;
                }
                RefreshReason::RateLimited => {
                    let wait = outcome
                        .retry_after
                        .unwrap_or_else(|| config.refresh.rate_limit_backoff());
                    warn!(round, wait_ms = wait.as_millis() as u64, "refresh rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
                RefreshReason::NetworkError => {
                    if !self.inner.probe.check().await.connected {
                        return Err(ApiError::offline());
                    }
                    return Err(ApiError::auth(
                        "Connection error while refreshing the session. Please try again.",
                    ));
                }
                RefreshReason::NoRefreshToken => {
                    return Err(ApiError::auth(
                        "No refresh token available. Please sign in again.",
                    ));
                }
                RefreshReason::RefreshTokenInvalid => {
                    return Err(ApiError::auth("Session expired. Please sign in again."));
                }
                RefreshReason::UnknownError => {
                    if let Some(error) = &outcome.error {
                        warn!(error = %error, "refresh failed");
                    }
                    return Err(ApiError::auth(
                        "Failed to refresh the session. Please sign in again.",
                    ));
                }
            }
        }

        Err(ApiError::auth(
            "Too many refresh attempts. Please sign in again.",
        ))
    }

    /// One wire exchange under the request deadline.
    async fn send(&self, bearer: Option<&str>) -> Result<TransportResponse, ApiError> {
        let mut request = TransportRequest::new(self.method.clone(), self.url.clone());
        request.headers = self.headers.clone();
        if self.body.is_some() && !request.headers.contains_key(header::CONTENT_TYPE) {
            request.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        if let Some(token) = bearer {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ApiError::auth("Stored access token is not a valid header value"))?;
            value.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, value);
        }
        request.body = self.body.clone();

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.inner.transport.send(request)).await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ApiError::from(e)),
            Err(_) => Err(ApiError::timeout(self.timeout)),
        };

        let status = match &result {
            Ok(response) => response.status,
            Err(e) => e.status,
        };
        let elapsed = started.elapsed();
        metrics::record_request(self.method.as_str(), status, elapsed.as_secs_f64());
        debug!(status, elapsed_ms = elapsed.as_millis() as u64, "exchange finished");
        result
    }
}

/// Map a response that is not a 401 being recovered onto the caller result.
fn interpret(response: TransportResponse) -> Result<Value, ApiError> {
    let status = response.status;
    if response.is_success() {
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&response.body).map_err(|e| ApiError::parse(status, e));
    }

    let payload: Option<Value> = serde_json::from_str(&response.body).ok();

    if status == 429 {
        let retry_after = retry_after_header(&response).unwrap_or(DEFAULT_RATE_LIMIT_RETRY_AFTER);
        let message = server_message(payload.as_ref()).unwrap_or_else(|| {
            format!(
                "Too many requests. Retry in {} second(s).",
                retry_after.as_millis().div_ceil(1000)
            )
        });
        warn!(retry_after_ms = retry_after.as_millis() as u64, "rate limited");
        return Err(ApiError::rate_limited(
            message,
            retry_after,
            payload.unwrap_or(Value::Null),
        ));
    }

    let message = server_message(payload.as_ref())
        .or_else(|| {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP error {status}"));
    debug!(status, message = %message, "request failed");
    Err(ApiError::http(status, message, payload))
}

/// `message`, else `error`, when either is a non-empty string.
fn server_message(payload: Option<&Value>) -> Option<String> {
    let payload = payload?;
    ["message", "error"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
