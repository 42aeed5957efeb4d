//! GitLab connector for groupsync.
//!
//! Realises groups as subgroups of one configured parent group. In the
//! usual deployment GitLab's own LDAP integration provisions users and
//! membership; the connector then only manages the subgroup and its
//! directory link, and advertises the sync flags so the reconciler skips
//! what the directory owns.

mod groups;
mod rest;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use groupsync_core::config::{BackendConfig, HttpClientConfig};
use groupsync_core::connectors::registry::require_connection_param;
use groupsync_core::connectors::{Connector, Team, User};

use rest::GitlabRestClient;

/// Backend type this connector registers under.
pub const BACKEND_TYPE: &str = "gitlab";

/// The GitLab connector.
#[derive(Debug)]
pub struct GitlabConnector {
    rest_client: GitlabRestClient,
    parent_group_id: u64,
    ldap_sync: bool,
    sso_sync: bool,
    ldap_provider: String,
    ldap_group_cn: Option<String>,
}

impl GitlabConnector {
    /// Instantiate a connector from a backend's connection parameters.
    /// Requires `url`, `token` and `parent_group_id`; `ldap_sync: "true"`
    /// turns on the directory-sync flags, with `ldap_provider` naming the
    /// GitLab auth provider the links point at.
    pub fn new(config: &BackendConfig, http: &HttpClientConfig) -> Result<Self> {
        let url = require_connection_param(config, "url")?;
        let token = require_connection_param(config, "token")?;
        let parent_group_id = require_connection_param(config, "parent_group_id")?
            .parse::<u64>()
            .context("parent_group_id must be numeric")?;

        let ldap_sync = config
            .connection
            .get("ldap_sync")
            .map(|v| v == "true")
            .unwrap_or(false);
        let ldap_provider = config
            .connection
            .get("ldap_provider")
            .cloned()
            .unwrap_or_else(|| "ldapmain".to_owned());

        Ok(Self {
            rest_client: GitlabRestClient::new(&url, token, http)
                .context("building gitlab rest client")?,
            parent_group_id,
            ldap_sync,
            // membership flows through the same directory link
            sso_sync: ldap_sync,
            ldap_provider,
            ldap_group_cn: None,
        })
    }

    /// A registry builder closure bound to the given HTTP settings.
    pub fn builder(
        http: HttpClientConfig,
    ) -> impl Fn(&BackendConfig) -> Result<Box<dyn Connector>> + Send + Sync + 'static {
        move |config| Ok(Box::new(GitlabConnector::new(config, &http)?) as Box<dyn Connector>)
    }
}

#[async_trait]
impl Connector for GitlabConnector {
    async fn fetch_all_users(&self) -> Result<(HashMap<String, User>, HashMap<String, User>)> {
        // LDAP-synced instances provision users from the directory; the
        // reconciler matches by username there instead
        if self.ldap_sync {
            return Ok((HashMap::new(), HashMap::new()));
        }
        let users = self.rest_client.list_users().await?;
        let by_email = users
            .iter()
            .filter(|u| !u.email.is_empty())
            .map(|u| (u.email.to_owned(), u.to_owned()))
            .collect();
        let by_id = users.into_iter().map(|u| (u.id.to_owned(), u)).collect();
        Ok((by_email, by_id))
    }

    async fn fetch_user_details(&self, user_id: &str) -> Result<User> {
        let id = self.rest_client.resolve_user_id(user_id).await?;
        let users = self.rest_client.list_users().await?;
        users
            .into_iter()
            .find(|u| u.id == id.to_string())
            .ok_or_else(|| anyhow::anyhow!("user not found: {user_id}"))
    }

    async fn create_user(&self, user: &User) -> Result<User> {
        bail!(
            "gitlab users are provisioned by the directory sync, refusing to create {}",
            user.email
        )
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        bail!("gitlab users are deprovisioned by the directory sync, refusing to delete {user_id}")
    }

    async fn fetch_all_teams(&self) -> Result<HashMap<String, Team>> {
        let teams = self.rest_client.list_subgroups(self.parent_group_id).await?;
        Ok(teams.into_iter().map(|t| (t.name.to_owned(), t)).collect())
    }

    async fn fetch_team_details(&self, team_id: &str) -> Result<Team> {
        self.rest_client.group_details(team_id).await
    }

    async fn create_team(&self, team: &Team) -> Result<Team> {
        let created = self
            .rest_client
            .create_subgroup(self.parent_group_id, team)
            .await?;
        if self.ldap_sync {
            let cn = self
                .ldap_group_cn
                .as_deref()
                .unwrap_or(created.name.as_str());
            self.rest_client
                .add_ldap_link(&created.id, cn, &self.ldap_provider)
                .await;
        }
        Ok(created)
    }

    async fn delete_team_by_id(&self, team_id: &str) -> Result<()> {
        self.rest_client.delete_group(team_id).await
    }

    async fn fetch_team_members(&self, team_id: &str) -> Result<HashMap<String, User>> {
        self.rest_client.group_members(team_id).await
    }

    async fn add_users_to_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() || self.sso_sync {
            return Ok(());
        }
        self.rest_client.add_group_members(team_id, user_ids).await
    }

    async fn remove_users_from_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() || self.sso_sync {
            return Ok(());
        }
        self.rest_client
            .remove_group_members(team_id, user_ids)
            .await
    }

    fn set_ldap_sync(&mut self, enabled: bool, group_cn: Option<String>) {
        self.ldap_sync = enabled;
        self.ldap_group_cn = group_cn;
    }

    fn set_sso_sync(&mut self, enabled: bool) {
        self.sso_sync = enabled;
    }

    fn ldap_synced(&self) -> bool {
        self.ldap_sync
    }

    fn sso_synced(&self) -> bool {
        self.sso_sync
    }
}
