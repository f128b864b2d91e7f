//! # ceems-api
//!
//! Client-side contracts for the CEEMS API collaborator.
//!
//! The API/DB tier is an external collaborator: it periodically ingests
//! scheduler accounting records into an embedded relational store and
//! exposes HTTP endpoints for unit listing and ownership verification.
//! This crate implements only the interfaces the load balancer consumes
//! from it:
//!
//! - [`OwnershipOracle`]: does a user own (or share a project with) every
//!   compute unit in a set of UUIDs?
//! - [`AdminUsers`]: the set of users allowed to impersonate dashboard
//!   users, statically configured plus an optional periodic refresh from
//!   Grafana team membership.

pub mod admin;
pub mod grafana;
pub mod ownership;

pub use admin::AdminUsers;
pub use grafana::GrafanaClient;
pub use ownership::{DbOracle, HttpOracle, MockOracle, OwnershipOracle};

/// Result type for API collaborator operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur talking to the API collaborator
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected response status from the collaborator
    #[error("Unexpected response status: {0}")]
    Status(u16),

    /// Embedded database errors
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Malformed response payload
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Core errors
    #[error(transparent)]
    Core(#[from] ceems_core::Error),
}
