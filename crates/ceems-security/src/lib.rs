//! # ceems-security
//!
//! Capability-scoped execution contexts for privileged CEEMS operations.
//!
//! Opening `perf_event` descriptors, reading the environment of foreign
//! processes and forking privileged subprocesses all require Linux
//! capabilities the exporter must not hold ambiently. A [`SecurityContext`]
//! owns a dedicated OS thread: each submitted closure runs on that thread
//! with the context's capability set raised in the effective set, and the
//! capabilities are dropped again on every exit path, including panics.
//!
//! Capability state is a per-thread property on Linux, which is why the
//! elevated closure must be pinned to a thread the async runtime never
//! migrates tasks onto. One context is created per subsystem needing a
//! distinct capability set, never shared as a global singleton.

pub mod context;

pub use context::SecurityContext;

pub use caps::Capability;

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;

/// Errors that can occur while managing capability contexts
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// The executor thread could not be spawned
    #[error("Failed to spawn security context thread: {0}")]
    Spawn(String),

    /// A capability could not be raised or dropped
    #[error("Capability operation failed for {name}: {source}")]
    Caps {
        /// Context name, for diagnostics
        name: String,
        /// Underlying caps error
        source: caps::errors::CapsError,
    },

    /// The requested capabilities are not in the permitted set
    #[error("Capabilities not permitted for {0}: {1:?}")]
    NotPermitted(String, Vec<Capability>),

    /// The submitted closure panicked
    #[error("Job panicked inside security context {0}")]
    JobPanicked(String),

    /// The executor thread is no longer running
    #[error("Security context {0} has shut down")]
    Terminated(String),
}
