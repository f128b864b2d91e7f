//! Configuration for the load balancer

use crate::strategy::Strategy;
use crate::{LbError, Result};
use ceems_core::LOGGED_USER_HEADER;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Complete configuration for the load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbConfig {
    /// Address the proxy binds to
    pub listen_address: String,

    /// Backend selection strategy
    pub strategy: Strategy,

    /// Backend pools, one entry per cluster
    pub clusters: Vec<ClusterConfig>,

    /// Liveness probe interval (seconds)
    pub probe_interval_seconds: u64,

    /// Per-request deadline towards backends (seconds)
    pub request_timeout_seconds: u64,

    /// Name of the header carrying the caller identity
    pub identity_header: String,

    /// Access control configuration
    pub auth: AuthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// One cluster's backend replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identity matched against the routing header
    pub id: String,

    /// Backend base URLs
    pub backends: Vec<String>,
}

/// Access control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Statically configured admin users
    pub admin_users: Vec<String>,

    /// Ownership oracle mode
    pub ownership: OwnershipConfig,

    /// Optional Grafana team sync for the admin list
    pub grafana: Option<GrafanaConfig>,
}

/// Where ownership checks are resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum OwnershipConfig {
    /// Query the API collaborator over HTTP
    Api {
        /// Base URL of the collaborator
        url: String,
    },
    /// Query the collaborator's SQLite database read-only (colocated
    /// deployments)
    Db {
        /// Path to the database file
        path: PathBuf,
    },
}

/// Grafana admin sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrafanaConfig {
    /// Grafana base URL
    pub url: String,

    /// Team whose members become admins
    pub team_id: u64,

    /// Optional bearer token
    pub api_token: Option<String>,

    /// Sync interval (seconds)
    pub refresh_interval_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9030".to_string(),
            strategy: Strategy::RoundRobin,
            clusters: Vec::new(),
            probe_interval_seconds: 10,
            request_timeout_seconds: 30,
            identity_header: LOGGED_USER_HEADER.to_string(),
            auth: AuthConfig {
                admin_users: Vec::new(),
                ownership: OwnershipConfig::Api {
                    url: "http://localhost:9020".to_string(),
                },
                grafana: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl LbConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| LbError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(LbError::Configuration("no clusters configured".to_string()));
        }

        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.is_empty() {
                return Err(LbError::Configuration("empty cluster id".to_string()));
            }
            if !seen.insert(&cluster.id) {
                return Err(LbError::Configuration(format!(
                    "duplicate cluster id {}",
                    cluster.id
                )));
            }
            if cluster.backends.is_empty() {
                return Err(LbError::Configuration(format!(
                    "cluster {} has no backends",
                    cluster.id
                )));
            }
        }

        if self.probe_interval_seconds == 0 {
            return Err(LbError::Configuration("probe interval must be non-zero".to_string()));
        }
        if self.request_timeout_seconds == 0 {
            return Err(LbError::Configuration("request timeout must be non-zero".to_string()));
        }

        Ok(())
    }
}
