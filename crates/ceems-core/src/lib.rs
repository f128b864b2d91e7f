//! # ceems-core
//!
//! Core types, errors and utilities for CEEMS - a compute energy and
//! emissions monitoring system for HPC and cloud batch clusters.
//!
//! This crate provides the foundational data structures shared across the
//! collector engine and the load balancer:
//!
//! - Compute unit and job property models
//! - Resource manager identifiers
//! - A unified error type with HTTP status mapping
//! - Prometheus-style duration parsing used for TSDB retention periods

pub mod duration;
pub mod error;
pub mod types;

// Re-export commonly used types at the crate root
pub use duration::{format_duration, parse_duration};
pub use error::{Error, Result};
pub use types::{ComputeUnit, JobProps, ResourceManagerKind};

/// Metric namespace prefixed to every exported metric name.
pub const NAMESPACE: &str = "ceems";

/// Header carrying the identity of the logged-in user.
pub const LOGGED_USER_HEADER: &str = "X-Grafana-User";

/// Header carrying the user a dashboard is rendered for. Only honored
/// when the logged-in user is an admin.
pub const DASHBOARD_USER_HEADER: &str = "X-Dashboard-User";

/// Header naming the cluster a load balancer request targets.
pub const CLUSTER_ID_HEADER: &str = "X-Ceems-Cluster-Id";
