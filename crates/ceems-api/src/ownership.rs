//! Ownership verification against the API collaborator
//!
//! A user may query the metrics of a compute unit when they are its direct
//! owner or share a project/account with it. The check is ALL-quantified:
//! one failing UUID fails the whole request. Two interchangeable modes
//! exist, an HTTP call to the collaborator and a direct query against its
//! embedded database when colocated; behavior is identical, only latency
//! differs.

use crate::{ApiError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use rusqlite::{Connection, OpenFlags};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Resolves whether a user may access a set of compute units.
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    /// Returns `Ok(true)` iff `user` owns or shares a project with every
    /// unit in `uuids`. An empty UUID list passes vacuously.
    async fn verify(&self, user: &str, uuids: &[String]) -> Result<bool>;
}

/// Oracle backed by the collaborator's `/units/verify` endpoint.
pub struct HttpOracle {
    client: reqwest::Client,
    verify_url: String,
    identity_header: String,
}

impl HttpOracle {
    /// Create an oracle against the collaborator at `base_url`
    /// (e.g. `http://localhost:9020`).
    pub fn new(base_url: &str, identity_header: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            verify_url: format!("{}/api/v1/units/verify", base_url.trim_end_matches('/')),
            identity_header: identity_header.into(),
        })
    }
}

#[async_trait]
impl OwnershipOracle for HttpOracle {
    async fn verify(&self, user: &str, uuids: &[String]) -> Result<bool> {
        if uuids.is_empty() {
            return Ok(true);
        }

        let query: Vec<(&str, &str)> = uuids.iter().map(|u| ("uuid", u.as_str())).collect();

        let response = self
            .client
            .get(&self.verify_url)
            .header(&self.identity_header, user)
            .query(&query)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(ApiError::Status(status.as_u16())),
        }
    }
}

/// Oracle backed by a read-only handle on the collaborator's SQLite
/// database, for colocated deployments.
pub struct DbOracle {
    // rusqlite connections are not Sync; serialize access
    conn: Mutex<Connection>,
}

impl DbOracle {
    /// Open the collaborator database read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Ownership check against the `units` table. Runs on the caller
    /// thread; queries are point lookups on indexed columns.
    fn verify_sync(&self, user: &str, uuids: &[String]) -> Result<bool> {
        let conn = self.conn.lock();

        // Projects the user has ever been a member of
        let mut stmt = conn.prepare_cached("SELECT DISTINCT project FROM units WHERE usr = ?1")?;
        let projects: HashSet<String> = stmt
            .query_map([user], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut stmt =
            conn.prepare_cached("SELECT usr, project FROM units WHERE uuid = ?1 LIMIT 1")?;

        for uuid in uuids {
            let row: Option<(String, String)> = stmt
                .query_row([uuid], |row| Ok((row.get(0)?, row.get(1)?)))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })?;

            let allowed = match row {
                Some((owner, project)) => owner == user || projects.contains(&project),
                // Unknown unit: deny rather than leak whether it exists
                None => false,
            };

            if !allowed {
                debug!(user, uuid, "Ownership check failed");
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl OwnershipOracle for DbOracle {
    async fn verify(&self, user: &str, uuids: &[String]) -> Result<bool> {
        if uuids.is_empty() {
            return Ok(true);
        }

        self.verify_sync(user, uuids)
    }
}

/// In-memory oracle for tests: maps `uuid -> (owner, project)` plus a
/// `user -> projects` membership table.
#[derive(Debug, Default)]
pub struct MockOracle {
    units: HashMap<String, (String, String)>,
    memberships: HashMap<String, HashSet<String>>,
}

impl MockOracle {
    /// Empty oracle denying everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit with its owner and project.
    pub fn with_unit(
        mut self,
        uuid: impl Into<String>,
        owner: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        let project = project.into();
        self.memberships
            .entry(owner.clone())
            .or_default()
            .insert(project.clone());
        self.units.insert(uuid.into(), (owner, project));
        self
    }

    /// Add a project membership without a unit.
    pub fn with_membership(mut self, user: impl Into<String>, project: impl Into<String>) -> Self {
        self.memberships
            .entry(user.into())
            .or_default()
            .insert(project.into());
        self
    }
}

#[async_trait]
impl OwnershipOracle for MockOracle {
    async fn verify(&self, user: &str, uuids: &[String]) -> Result<bool> {
        let projects = self.memberships.get(user);

        Ok(uuids.iter().all(|uuid| match self.units.get(uuid) {
            Some((owner, project)) => {
                owner == user || projects.map(|p| p.contains(project)).unwrap_or(false)
            }
            None => false,
        }))
    }
}
