//! Admin user oracle
//!
//! Admin users may impersonate dashboard users and bypass per-unit
//! ownership checks. The list is static at startup, optionally augmented
//! by a periodic sync from Grafana team membership. A failed refresh
//! keeps the previously synced list.

use crate::GrafanaClient;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read-mostly set of admin users.
pub struct AdminUsers {
    static_users: HashSet<String>,
    synced_users: RwLock<HashSet<String>>,
    grafana: Option<GrafanaClient>,
}

impl AdminUsers {
    /// Create the oracle from the statically configured user list.
    pub fn new(static_users: impl IntoIterator<Item = String>) -> Self {
        Self {
            static_users: static_users.into_iter().collect(),
            synced_users: RwLock::new(HashSet::new()),
            grafana: None,
        }
    }

    /// Attach a Grafana client whose team members are merged into the
    /// admin set on each refresh.
    pub fn with_grafana(mut self, grafana: GrafanaClient) -> Self {
        self.grafana = Some(grafana);
        self
    }

    /// True when `user` is in the static list or the last synced list.
    pub fn is_admin(&self, user: &str) -> bool {
        self.static_users.contains(user) || self.synced_users.read().contains(user)
    }

    /// Fetch team members from Grafana and replace the synced list.
    /// Errors keep the previous list.
    pub async fn refresh(&self) {
        let Some(grafana) = &self.grafana else {
            return;
        };

        match grafana.team_members().await {
            Ok(members) => {
                let mut synced = self.synced_users.write();
                *synced = members.into_iter().collect();
                debug!(count = synced.len(), "Synced admin users from Grafana");
            }
            Err(e) => {
                warn!(error = %e, "Admin user sync failed, keeping previous list");
            }
        }
    }

    /// Spawn a background task refreshing the synced list every
    /// `interval`. Runs one refresh immediately.
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

impl std::fmt::Debug for AdminUsers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminUsers")
            .field("static_users", &self.static_users)
            .field("synced_users", &*self.synced_users.read())
            .field("grafana", &self.grafana.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_admins() {
        let admins = AdminUsers::new(["adm1".to_string(), "adm2".to_string()]);
        assert!(admins.is_admin("adm1"));
        assert!(admins.is_admin("adm2"));
        assert!(!admins.is_admin("usr1"));
    }

    #[test]
    fn test_synced_admins_merge() {
        let admins = AdminUsers::new(["adm1".to_string()]);
        admins.synced_users.write().insert("grafana-adm".to_string());

        assert!(admins.is_admin("adm1"));
        assert!(admins.is_admin("grafana-adm"));
        assert!(!admins.is_admin("usr1"));
    }

    #[tokio::test]
    async fn test_refresh_without_grafana_is_noop() {
        let admins = AdminUsers::new(["adm1".to_string()]);
        admins.refresh().await;
        assert!(admins.is_admin("adm1"));
        assert!(admins.synced_users.read().is_empty());
    }
}
