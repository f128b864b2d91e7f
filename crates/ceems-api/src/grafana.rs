//! Grafana team membership client
//!
//! Used by the admin oracle to periodically sync the set of users in a
//! designated Grafana team into the admin list.

use crate::{ApiError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Minimal Grafana HTTP client fetching members of one team.
#[derive(Debug, Clone)]
pub struct GrafanaClient {
    client: reqwest::Client,
    members_url: String,
    api_token: Option<String>,
}

/// One entry of the `/api/teams/{id}/members` response; only the login
/// is relevant.
#[derive(Debug, Deserialize)]
struct TeamMember {
    login: String,
}

impl GrafanaClient {
    /// Create a client for the team `team_id` on the Grafana instance at
    /// `base_url`. `api_token` is sent as a bearer token when present.
    pub fn new(base_url: &str, team_id: u64, api_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            members_url: format!("{}/api/teams/{}/members", base_url.trim_end_matches('/'), team_id),
            api_token,
        })
    }

    /// Fetch the logins of all members of the configured team.
    pub async fn team_members(&self) -> Result<Vec<String>> {
        let mut request = self.client.get(&self.members_url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }

        let members: Vec<TeamMember> = response.json().await?;

        Ok(members.into_iter().map(|m| m.login).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_url() {
        let c = GrafanaClient::new("http://grafana:3000/", 7, None).unwrap();
        assert_eq!(c.members_url, "http://grafana:3000/api/teams/7/members");
    }

    #[test]
    fn test_member_payload_shape() {
        let raw = r#"[{"orgId":1,"teamId":7,"login":"usr1","email":"u@x"},{"login":"usr2"}]"#;
        let members: Vec<TeamMember> = serde_json::from_str(raw).unwrap();
        let logins: Vec<_> = members.into_iter().map(|m| m.login).collect();
        assert_eq!(logins, vec!["usr1", "usr2"]);
    }
}
