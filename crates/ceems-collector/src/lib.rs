//! # ceems-collector
//!
//! Per-node collector engine for CEEMS.
//!
//! The collector joins process-tree membership (via the kernel control
//! group hierarchy), scheduler-assigned job identifiers, GPU ownership,
//! hardware performance counters and baseboard power telemetry, and emits
//! scrape-time metrics in the Prometheus text exposition format:
//!
//! - [`cgroups`]: discovery of live compute-unit cgroups and their process
//!   membership
//! - [`resource`]: resource-manager adapters enriching units with
//!   scheduler metadata
//! - [`gpu`]: GPU ordinal to compute-unit ownership resolution
//! - [`perf`]: per-PID hardware/software/cache counter profiling with
//!   capability-gated open/close and multiplexing-aware delta scaling
//! - [`ipmi`]: IPMI DCMI baseboard power readings with a privilege
//!   escalation fallback chain
//! - [`engine`] and [`exposition`]: concurrent scrape orchestration and
//!   text serialization
//! - [`server`]: the `/metrics` HTTP surface

pub mod cgroups;
pub mod config;
pub mod engine;
pub mod exposition;
pub mod gpu;
pub mod ipmi;
pub mod perf;
pub mod resource;
pub mod server;

// Re-export main types
pub use cgroups::{Cgroup, CgroupManager, ProcInfo};
pub use config::CollectorConfig;
pub use engine::{Collector, CollectorEngine};
pub use exposition::{Sample, SampleKind};

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Errors that can occur during collection
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The kernel or the process lacks a required capability
    #[error("Capability error: {0}")]
    Capability(String),

    /// External tool invocation failed
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    /// Unexpected output from an external tool
    #[error("Parse error: {0}")]
    Parse(String),

    /// Metric encoding failed
    #[error("Exposition error: {0}")]
    Exposition(String),

    /// Security context errors
    #[error("Security context error: {0}")]
    Security(#[from] ceems_security::SecurityError),

    /// procfs access errors
    #[error("procfs error: {0}")]
    Procfs(#[from] procfs::ProcError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core errors
    #[error(transparent)]
    Core(#[from] ceems_core::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CollectorError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a capability error
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Transient errors skip the affected unit or sub-collector without
    /// failing the scrape; anything else needs operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollectorError::Io(_)
                | CollectorError::Procfs(_)
                | CollectorError::Subprocess(_)
                | CollectorError::Parse(_)
        )
    }
}

/// Hostname label attached to every emitted metric.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
