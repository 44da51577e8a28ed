//! reqwest-backed transport
//!
//! Forwards a `TransportRequest` verbatim and reads the body as text. Every
//! reqwest failure is mapped onto `TransportError` so no reqwest types leak
//! past this module.

use crate::{Result, Transport, TransportError, TransportRequest, TransportResponse};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Production `Transport` over a shared `reqwest::Client`.
///
/// The client's own timeout is left unset by default; request deadlines are
/// enforced by the executor so a timeout surfaces as a structured 408.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        Box::pin(async move {
            let TransportRequest {
                method,
                url,
                headers,
                body,
            } = request;

            debug!(%method, %url, "sending request");

            let mut builder = self.client.request(method, url).headers(headers);
            if let Some(body) = body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_error)?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?;

            debug!(status, bytes = body.len(), "received response");
            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        TransportError::Body(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
