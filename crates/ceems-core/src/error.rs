//! Error handling for CEEMS
//!
//! Provides a unified error type and result type shared by the collector
//! engine and the load balancer.

/// Result type alias for CEEMS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for CEEMS
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors, fatal at startup
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Missing privileges for a requested operation
    #[error("Insufficient capabilities: {0}")]
    Capability(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource temporarily unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a capability error
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error might succeed on a future attempt.
    ///
    /// Transient errors are logged and skipped at scrape time; everything
    /// else requires operator intervention and is fatal at startup.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Unavailable(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Convert to HTTP status code for REST responses
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidConfiguration(_) | Error::InvalidRequest(_) => 400,
            Error::PermissionDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::Timeout(_) => 408,
            Error::Unavailable(_) => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("missing cgroup root");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: missing cgroup root");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::timeout("probe").is_transient());
        assert!(Error::not_found("proc gone").is_transient());
        assert!(!Error::config("bad flag").is_transient());
        assert!(!Error::capability("cap_perfmon").is_transient());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::invalid_request("test").to_http_status(), 400);
        assert_eq!(Error::permission_denied("test").to_http_status(), 403);
        assert_eq!(Error::internal("test").to_http_status(), 500);
        assert_eq!(Error::unavailable("test").to_http_status(), 503);
    }
}
