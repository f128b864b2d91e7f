//! Load balancer HTTP surface
//!
//! A transparent proxy of the backend API under the same paths. The
//! target cluster comes from the routing header; a transport-level
//! failure marks the chosen backend dead and retries the next candidate
//! once. Response-status errors from a live backend are returned
//! verbatim.

use crate::middleware::{auth_middleware, error_response, AuthState};
use crate::pool::ClusterPools;
use crate::proxy::Proxy;
use crate::strategy::time_window_from_query;
use crate::{LbError, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Upper bound on buffered request bodies; PromQL POST bodies are small.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared proxy state.
#[derive(Clone)]
pub struct LbState {
    pools: Arc<ClusterPools>,
    proxy: Arc<Proxy>,
    cluster_header: String,
}

impl LbState {
    /// Create the proxy state.
    pub fn new(pools: Arc<ClusterPools>, proxy: Arc<Proxy>, cluster_header: String) -> Self {
        Self {
            pools,
            proxy,
            cluster_header,
        }
    }
}

/// Build the load balancer router. Every path except `/health` is
/// proxied behind the access control layer.
pub fn router(state: LbState, auth: Arc<AuthState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// Serve the load balancer until shutdown.
pub async fn serve(state: LbState, auth: Arc<AuthState>, address: &str) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "Starting CEEMS load balancer");

    axum::serve(listener, router(state, auth))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}

async fn proxy_handler(State(state): State<LbState>, request: Request<Body>) -> Response {
    match proxy_request(&state, request).await {
        Ok(response) => response,
        Err(e) => lb_error_response(&e),
    }
}

async fn proxy_request(state: &LbState, request: Request<Body>) -> Result<Response> {
    // Resolve the target cluster: routing header, or the only cluster
    // configured
    let cluster_id = match request
        .headers()
        .get(&state.cluster_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(id) => id.to_string(),
        None => state
            .pools
            .single_cluster_id()
            .ok_or_else(|| {
                LbError::BadRequest(format!("missing cluster header {}", state.cluster_header))
            })?
            .to_string(),
    };

    let pool = state
        .pools
        .pool(&cluster_id)
        .ok_or_else(|| LbError::UnknownCluster(cluster_id.clone()))?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| LbError::BadRequest(format!("unreadable request body: {}", e)))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let window = time_window_from_query(parts.uri.query());

    let backend = pool
        .select(state.pools.strategy(), window)
        .ok_or(LbError::NoBackend)?;

    let guard = backend.connection_guard();
    let outcome = state
        .proxy
        .forward(&backend, parts.method.clone(), &path_and_query, &parts.headers, body.clone())
        .await;
    drop(guard);

    match outcome {
        Ok((response_parts, response_body)) => Ok(raw_response(response_parts, response_body)),
        Err(e @ (LbError::Transport(_) | LbError::Timeout)) => {
            warn!(backend = %backend.url(), error = %e, "Backend transport failure, marking dead");
            backend.set_alive(false);

            // Single retry against the next candidate
            let retry_backend = pool.next_candidate(&backend).ok_or(LbError::NoBackend)?;
            let _guard = retry_backend.connection_guard();

            match state
                .proxy
                .forward(&retry_backend, parts.method, &path_and_query, &parts.headers, body)
                .await
            {
                Ok((response_parts, response_body)) => {
                    Ok(raw_response(response_parts, response_body))
                }
                Err(retry_error @ (LbError::Transport(_) | LbError::Timeout)) => {
                    warn!(backend = %retry_backend.url(), error = %retry_error, "Retry backend failed");
                    retry_backend.set_alive(false);
                    Err(retry_error)
                }
                Err(other) => Err(other),
            }
        }
        Err(other) => Err(other),
    }
}

/// Rebuild the backend response verbatim. The body was collected, so
/// the upstream framing headers no longer apply.
fn raw_response(parts: hyper::http::response::Parts, body: Bytes) -> Response {
    let mut headers = parts.headers;
    headers.remove(hyper::header::TRANSFER_ENCODING);
    headers.remove(hyper::header::CONNECTION);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers;
    response
}

fn lb_error_response(error: &LbError) -> Response {
    let status =
        StatusCode::from_u16(error.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match error {
        // Bare 403, no detail of what was checked
        LbError::Forbidden => status.into_response(),
        LbError::BadRequest(message) => error_response(status, "bad_request", message),
        LbError::UnknownCluster(cluster) => {
            error_response(status, "unknown_cluster", &format!("unknown cluster {}", cluster))
        }
        other => error_response(status, "proxy_error", &other.to_string()),
    }
}
