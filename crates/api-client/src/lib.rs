//! Resilient JSON API client
//!
//! `ApiClient` wraps a `Transport` with the resilience layer: bearer
//! authentication with single-flight refresh on 401, retry with exponential
//! backoff, a priority admission queue, per-endpoint deadlines and offline
//! fallbacks.
//!
//! ```ignore
//! let client = ApiClient::builder(ClientConfig::new("https://api.example.com"))
//!     .credential_store(store)
//!     .build()?;
//! let me: User = client.get("/users/me", RequestOptions::new()).await?;
//! ```

pub mod client;
pub mod config;
pub mod fallback;
pub mod options;

pub use client::{ApiClient, ApiClientBuilder, DEFAULT_RATE_LIMIT_RETRY_AFTER};
pub use config::{ClientConfig, PriorityRule, TimeoutRule};
pub use fallback::{FallbackFn, OfflineFallbacks};
pub use options::{QueryValue, RequestOptions, RetrySetting, build_url};

pub use resilience::{ApiError, ErrorKind, Priority, RefreshOutcome, RefreshReason, RetryPolicy};
