//! Resilience primitives for the API client
//!
//! - `ApiError` / `ErrorKind`: the structured error every caller sees
//! - `with_retry` + `RetryPolicy`: classification and exponential backoff
//! - `AdmissionQueue`: priority-ordered, concurrency-capped scheduling
//! - `RefreshCoordinator`: single-flight, cooldown-guarded token refresh
//!
//! Request flow (driven by the executor in `api-client`):
//! 1. Non-urgent requests are admitted through the `AdmissionQueue`
//! 2. Inside the queued task, the wire call runs under `with_retry`
//! 3. A 401 drives the `RefreshCoordinator` directly, bypassing the queue
//! 4. On a fresh token the original request is re-issued exactly once

pub mod error;
pub mod metrics;
pub mod queue;
pub mod refresh;
pub mod retry;
pub mod retry_after;

pub use error::{ApiError, ErrorKind};
pub use queue::{AdmissionQueue, Priority};
pub use refresh::{RefreshConfig, RefreshCoordinator, RefreshOutcome, RefreshReason};
pub use retry::{RetryPolicy, Retryable, with_retry};
pub use retry_after::{parse_retry_after, retry_after_header};
