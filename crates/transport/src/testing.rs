//! Scripted in-process transport for tests
//!
//! Responses are queued per URL path. Each call pops the next scripted
//! response; the last one is repeated once the queue drains. Unscripted
//! paths answer 404. Every request is recorded so tests can assert on what
//! went over the "wire".

use crate::{
    HeaderMap, HeaderName, HeaderValue, Result, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One scripted reply: a response or a transport failure.
#[derive(Debug, Clone)]
pub struct Scripted {
    outcome: std::result::Result<TransportResponse, TransportError>,
    delay: Option<Duration>,
}

impl Scripted {
    /// Response with a JSON body.
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            crate::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            outcome: Ok(TransportResponse {
                status,
                headers,
                body: body.to_string(),
            }),
            delay: None,
        }
    }

    /// Response with an empty body.
    pub fn empty(status: u16) -> Self {
        Self::text(status, "")
    }

    /// Response with a raw text body.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            outcome: Ok(TransportResponse {
                status,
                headers: HeaderMap::new(),
                body: body.to_string(),
            }),
            delay: None,
        }
    }

    /// Transport failure instead of a response.
    pub fn error(err: TransportError) -> Self {
        Self {
            outcome: Err(err),
            delay: None,
        }
    }

    /// Add a response header. Ignored for scripted errors.
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(response) = &mut self.outcome {
            if let Ok(value) = HeaderValue::from_str(value) {
                response
                    .headers
                    .insert(HeaderName::from_static(name), value);
            }
        }
        self
    }

    /// Sleep (tokio time) before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, VecDeque<Scripted>>,
    log: Vec<TransportRequest>,
}

/// `Transport` that answers from per-path scripts.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<State>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reply for `path` (e.g. `/users`).
    pub fn push(&self, path: &str, reply: Scripted) -> &Self {
        self.lock()
            .scripts
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Requests sent to `path`, in order.
    pub fn requests(&self, path: &str) -> Vec<TransportRequest> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.url.path() == path)
            .cloned()
            .collect()
    }

    /// Number of requests sent to `path`.
    pub fn calls(&self, path: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }

    /// Paths of every request, in send order.
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .map(|r| r.url.path().to_string())
            .collect()
    }

    /// Total number of requests across all paths.
    pub fn total_calls(&self) -> usize {
        self.lock().log.len()
    }

    /// Bearer tokens seen on requests to `path`, `None` where unauthenticated.
    pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
        self.requests(path)
            .iter()
            .map(|r| {
                r.headers
                    .get(crate::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(str::to_string)
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self, request: TransportRequest) -> Option<Scripted> {
        let mut state = self.lock();
        let path = request.url.path().to_string();
        state.log.push(request);
        let queue = state.scripts.get_mut(&path)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        let reply = self.next_reply(request);
        Box::pin(async move {
            let Some(reply) = reply else {
                return Ok(TransportResponse {
                    status: 404,
                    headers: HeaderMap::new(),
                    body: String::new(),
                });
            };
            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            reply.outcome
        })
    }
}
