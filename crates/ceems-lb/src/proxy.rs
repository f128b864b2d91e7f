//! Request forwarding to TSDB backends

use crate::backend::Backend;
use crate::{LbError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::http::response::Parts;
use hyper::{HeaderMap, Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// HTTP proxy forwarding requests to upstream backends.
pub struct Proxy {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Proxy {
    /// Create a proxy with a per-request deadline. The deadline should
    /// sit slightly below the client-facing one so a slow backend still
    /// yields a well-formed gateway error.
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            client,
            timeout: request_timeout,
        }
    }

    /// Forward one request to `backend`, returning the response parts
    /// and collected body.
    ///
    /// Transport-level failures (refused, reset, timeout) surface as
    /// [`LbError::Transport`] / [`LbError::Timeout`] so the caller can
    /// fail over; response-status errors are returned verbatim and never
    /// trigger failover.
    pub async fn forward(
        &self,
        backend: &Backend,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(Parts, Bytes)> {
        let uri = format!("{}{}", backend.url(), path_and_query)
            .parse::<Uri>()
            .map_err(|e| LbError::BadRequest(format!("invalid proxy target: {}", e)))?;

        debug!(backend = %backend.url(), %method, path = path_and_query, "Forwarding request");

        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(request_headers) = builder.headers_mut() {
            for (name, value) in headers {
                // Host derives from the backend URI; connection headers
                // are hop-by-hop
                if name == hyper::header::HOST || name == hyper::header::CONNECTION {
                    continue;
                }
                request_headers.insert(name.clone(), value.clone());
            }
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| LbError::BadRequest(format!("failed to build proxy request: {}", e)))?;

        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| LbError::Timeout)?
            .map_err(|e| LbError::Transport(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| LbError::Transport(format!("failed to read backend response: {}", e)))?
            .to_bytes();

        Ok((parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_error_on_refused_connection() {
        // Nothing listens on this port; the failure must be
        // transport-level so failover engages
        let proxy = Proxy::new(Duration::from_secs(1));
        let backend = Backend::new("http://127.0.0.1:1");

        let err = proxy
            .forward(
                &backend,
                Method::GET,
                "/api/v1/query?query=up",
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LbError::Transport(_) | LbError::Timeout));
    }
}
