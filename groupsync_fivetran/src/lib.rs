//! Fivetran connector for groupsync.
//!
//! Realises groups as Fivetran teams. Users are invited by email; the
//! invite flow means a create can race an existing record, so conflicts
//! resolve against a re-fetch before giving up.

mod rest;
mod teams;
mod users;

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::info;

use groupsync_core::config::{BackendConfig, HttpClientConfig};
use groupsync_core::connectors::registry::require_connection_param;
use groupsync_core::connectors::{Conflict, Connector, Team, User};

use rest::{ApiError, FivetranRestClient};

/// Backend type this connector registers under.
pub const BACKEND_TYPE: &str = "fivetran";

/// The Fivetran connector.
#[derive(Debug)]
pub struct FivetranConnector {
    rest_client: FivetranRestClient,
    ldap_sync: bool,
    sso_sync: bool,
}

impl FivetranConnector {
    /// Instantiate a connector from a backend's connection parameters.
    /// Requires `api_key` and `api_secret`; `base_url` overrides the
    /// public API endpoint.
    pub fn new(config: &BackendConfig, http: &HttpClientConfig) -> Result<Self> {
        let api_key = require_connection_param(config, "api_key")?;
        let api_secret = require_connection_param(config, "api_secret")?;
        let base_url = config.connection.get("base_url").cloned();
        Ok(Self {
            rest_client: FivetranRestClient::new(base_url, api_key, api_secret, http)
                .context("building fivetran rest client")?,
            ldap_sync: false,
            sso_sync: false,
        })
    }

    /// A registry builder closure bound to the given HTTP settings.
    pub fn builder(
        http: HttpClientConfig,
    ) -> impl Fn(&BackendConfig) -> Result<Box<dyn Connector>> + Send + Sync + 'static {
        move |config| {
            Ok(Box::new(FivetranConnector::new(config, &http)?) as Box<dyn Connector>)
        }
    }

    /// Resolve a create conflict to the existing record: match by
    /// case-insensitive email, then by the username extracted from the
    /// email.
    async fn find_existing_user(&self, user: &User) -> Result<User> {
        let existing = self.rest_client.list_users().await?;
        let email = user.email.to_lowercase();
        if let Some(found) = existing.iter().find(|u| u.email.to_lowercase() == email) {
            return Ok(found.to_owned());
        }

        let prefix = user.email.split('@').next().unwrap_or(&user.email);
        existing
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(prefix))
            .cloned()
            .ok_or_else(|| anyhow!(Conflict))
    }
}

#[async_trait]
impl Connector for FivetranConnector {
    async fn fetch_all_users(&self) -> Result<(HashMap<String, User>, HashMap<String, User>)> {
        let users = self.rest_client.list_users().await?;
        let by_email = users
            .iter()
            .map(|u| (u.email.to_owned(), u.to_owned()))
            .collect();
        let by_id = users
            .into_iter()
            .map(|u| (u.id.to_owned(), u))
            .collect();
        Ok((by_email, by_id))
    }

    async fn fetch_user_details(&self, user_id: &str) -> Result<User> {
        self.rest_client.user_details(user_id).await
    }

    async fn create_user(&self, user: &User) -> Result<User> {
        match self.rest_client.invite_user(user).await {
            Ok(created) => Ok(created),
            Err(err)
                if err
                    .downcast_ref::<ApiError>()
                    .map(ApiError::is_conflict)
                    .unwrap_or(false) =>
            {
                info!(email = %user.email, "user already exists, fetching existing user details");
                self.find_existing_user(user).await
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.rest_client.remove_user(user_id).await
    }

    async fn fetch_all_teams(&self) -> Result<HashMap<String, Team>> {
        let teams = self.rest_client.list_teams().await?;
        Ok(teams.into_iter().map(|t| (t.name.to_owned(), t)).collect())
    }

    async fn fetch_team_details(&self, team_id: &str) -> Result<Team> {
        self.rest_client.team_details(team_id).await
    }

    async fn create_team(&self, team: &Team) -> Result<Team> {
        self.rest_client.create_team(team).await
    }

    async fn delete_team_by_id(&self, team_id: &str) -> Result<()> {
        self.rest_client.remove_team(team_id).await
    }

    async fn fetch_team_members(&self, team_id: &str) -> Result<HashMap<String, User>> {
        self.rest_client.team_members(team_id).await
    }

    async fn add_users_to_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.rest_client.add_team_members(team_id, user_ids).await
    }

    async fn remove_users_from_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.rest_client
            .remove_team_members(team_id, user_ids)
            .await
    }

    fn set_ldap_sync(&mut self, enabled: bool, _group_cn: Option<String>) {
        self.ldap_sync = enabled;
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
