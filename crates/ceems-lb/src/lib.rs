//! # ceems-lb
//!
//! Access-controlled load balancer for CEEMS.
//!
//! Sits in front of sharded time series databases (and optionally a
//! profile store) grouped by cluster identity. Every request is gated by
//! per-unit ownership checks against the API collaborator, routed to a
//! live backend by the configured strategy and proxied transparently:
//!
//! - [`backend`]: one TSDB replica with atomic liveness and connection
//!   accounting plus a stale-tolerant retention cache
//! - [`pool`]: cluster-keyed backend pools and strategy selection
//! - [`prober`]: background liveness and retention refresh
//! - [`middleware`]: identity, admin classification and ownership gating
//! - [`proxy`] and [`server`]: request forwarding with single-retry
//!   failover

pub mod backend;
pub mod config;
pub mod middleware;
pub mod pool;
pub mod prober;
pub mod proxy;
pub mod server;
pub mod strategy;

// Re-export main types
pub use backend::Backend;
pub use config::LbConfig;
pub use pool::{BackendPool, ClusterPools};
pub use strategy::Strategy;

/// Result type for load balancer operations
pub type Result<T> = std::result::Result<T, LbError>;

/// Errors that can occur during load balancing
#[derive(Debug, thiserror::Error)]
pub enum LbError {
    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed or incomplete request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The request names no resolvable cluster
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    /// Ownership verification denied the request
    #[error("Forbidden")]
    Forbidden,

    /// No live backend available for the cluster
    #[error("No backend available")]
    NoBackend,

    /// Transport-level failure talking to a backend
    #[error("Backend transport error: {0}")]
    Transport(String),

    /// Backend response exceeded the deadline
    #[error("Backend timeout")]
    Timeout,

    /// Errors from the API collaborator
    #[error("API collaborator error: {0}")]
    Api(#[from] ceems_api::ApiError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl LbError {
    /// Convert to the HTTP status code returned to the caller.
    pub fn to_status_code(&self) -> u16 {
        match self {
            LbError::Configuration(_) => 500,
            LbError::BadRequest(_) | LbError::UnknownCluster(_) => 400,
            LbError::Forbidden => 403,
            LbError::NoBackend => 503,
            LbError::Transport(_) => 502,
            LbError::Timeout => 504,
            LbError::Api(_) => 503,
            LbError::Io(_) | LbError::Http(_) | LbError::Other(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(LbError::BadRequest("no header".to_string()).to_status_code(), 400);
        assert_eq!(LbError::UnknownCluster("x".to_string()).to_status_code(), 400);
        assert_eq!(LbError::Forbidden.to_status_code(), 403);
        assert_eq!(LbError::NoBackend.to_status_code(), 503);
        assert_eq!(LbError::Transport("refused".to_string()).to_status_code(), 502);
        assert_eq!(LbError::Timeout.to_status_code(), 504);
    }
}
