//! Group (team), member, and LDAP-link operations against the GitLab
//! API. Teams map onto subgroups of one configured parent group.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use groupsync_core::connectors::{Team, User};

use crate::rest::{ApiError, GitlabRestClient};

/// Developer access for memberships the reconciler manages.
pub(crate) const DEVELOPER_ACCESS_LEVEL: u32 = 30;

#[derive(Deserialize)]
pub(crate) struct GitlabGroup {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<GitlabGroup> for Team {
    fn from(g: GitlabGroup) -> Self {
        Team {
            id: g.id.to_string(),
            name: g.name,
            description: g.description.unwrap_or_default(),
            role: String::new(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct GitlabUser {
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "public_email")]
    pub email: Option<String>,
    #[serde(default)]
    pub name: String,
}

impl From<GitlabUser> for User {
    fn from(u: GitlabUser) -> Self {
        User {
            id: u.id.to_string(),
            email: u.email.unwrap_or_default(),
            username: u.username,
            first_name: String::new(),
            last_name: String::new(),
            display_name: u.name,
            role: String::new(),
        }
    }
}

impl GitlabRestClient {
    /// All subgroups of the parent group, keyed by name.
    pub(crate) async fn list_subgroups(&self, parent_id: u64) -> Result<Vec<Team>> {
        let groups: Vec<GitlabGroup> = self
            .get_paginated(&format!("groups/{parent_id}/subgroups"))
            .await
            .context("fetching subgroups")?;
        info!(total_teams_count = groups.len(), "found teams");
        Ok(groups.into_iter().map(Team::from).collect())
    }

    /// Create a subgroup under the parent.
    pub(crate) async fn create_subgroup(&self, parent_id: u64, team: &Team) -> Result<Team> {
        info!(name = %team.name, "creating team");
        let body = json!({
            "name": team.name,
            "path": team.name,
            "parent_id": parent_id,
            "visibility": "private",
        });
        let created: GitlabGroup = self
            .request(Method::POST, "groups", Some(body))
            .await
            .context("creating the team")?;
        Ok(created.into())
    }

    /// One group by id.
    pub(crate) async fn group_details(&self, team_id: &str) -> Result<Team> {
        let group: GitlabGroup = self
            .request(Method::GET, &format!("groups/{team_id}"), None)
            .await
            .context("fetching team details")?;
        Ok(group.into())
    }

    /// Delete a group. Already-absent groups are a success.
    pub(crate) async fn delete_group(&self, team_id: &str) -> Result<()> {
        info!(team_id, "deleting the team");
        match self
            .request_no_content(Method::DELETE, &format!("groups/{team_id}"), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(err)
                if err
                    .downcast_ref::<ApiError>()
                    .map(ApiError::is_not_found)
                    .unwrap_or(false) =>
            {
                info!(team_id, "team already absent");
                Ok(())
            }
            Err(err) => Err(err).context("deleting the team"),
        }
    }

    /// Direct and inherited members of a group, keyed by backend user id.
    pub(crate) async fn group_members(&self, team_id: &str) -> Result<HashMap<String, User>> {
        let members: Vec<GitlabUser> = self
            .get_paginated(&format!("groups/{team_id}/members/all"))
            .await
            .context("fetching team members")?;
        Ok(members
            .into_iter()
            .map(User::from)
            .map(|u| (u.id.to_owned(), u))
            .collect())
    }

    /// Active human users on the instance.
    pub(crate) async fn list_users(&self) -> Result<Vec<User>> {
        let users: Vec<GitlabUser> = self
            .get_paginated("users?active=true&humans=true")
            .await
            .context("fetching list of users")?;
        info!(total_user_count = users.len(), "found users");
        Ok(users.into_iter().map(User::from).collect())
    }

    /// Resolve a membership identifier to the numeric user id. The
    /// reconciler hands over directory usernames when users are
    /// LDAP-synced; numeric ids pass through untouched.
    pub(crate) async fn resolve_user_id(&self, identifier: &str) -> Result<u64> {
        if let Ok(id) = identifier.parse::<u64>() {
            return Ok(id);
        }
        let matches: Vec<GitlabUser> = self
            .request(
                Method::GET,
                &format!("users?username={identifier}"),
                None,
            )
            .await
            .context("looking up user by username")?;
        matches
            .first()
            .map(|u| u.id)
            .ok_or_else(|| anyhow!("no gitlab user with username {identifier}"))
    }

    /// Add members with developer access; an existing membership counts
    /// as done.
    pub(crate) async fn add_group_members(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        for identifier in user_ids {
            let user_id = self.resolve_user_id(identifier).await?;
            let body = json!({ "user_id": user_id, "access_level": DEVELOPER_ACCESS_LEVEL });
            match self
                .request_no_content(
                    Method::POST,
                    &format!("groups/{team_id}/members"),
                    Some(body),
                )
                .await
            {
                Ok(()) => info!(team_id, identifier = %identifier, "added user to team"),
                Err(err)
                    if err
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_conflict)
                        .unwrap_or(false) =>
                {
                    info!(team_id, identifier = %identifier, "user already in team");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("adding user {identifier} to team {team_id}"))
                }
            }
        }
        Ok(())
    }

    /// Remove members; already-absent memberships count as done.
    pub(crate) async fn remove_group_members(
        &self,
        team_id: &str,
        user_ids: &[String],
    ) -> Result<()> {
        for identifier in user_ids {
            let user_id = self.resolve_user_id(identifier).await?;
            match self
                .request_no_content(
                    Method::DELETE,
                    &format!("groups/{team_id}/members/{user_id}"),
                    None,
                )
                .await
            {
                Ok(()) => info!(team_id, identifier = %identifier, "removed user from team"),
                Err(err)
                    if err
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_not_found)
                        .unwrap_or(false) =>
                {
                    info!(team_id, identifier = %identifier, "user already out of team");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing user {identifier} from team {team_id}"))
                }
            }
        }
        Ok(())
    }

    /// Link a group to its directory group so membership syncs from
    /// LDAP. Link failures are logged, not fatal: the sync catches up on
    /// its own schedule.
    pub(crate) async fn add_ldap_link(&self, team_id: &str, cn: &str, provider: &str) {
        let body = json!({
            "cn": cn,
            "group_access": DEVELOPER_ACCESS_LEVEL,
            "provider": provider,
        });
        match self
            .request_no_content(
                Method::POST,
                &format!("groups/{team_id}/ldap_group_links"),
                Some(body),
            )
            .await
        {
            Ok(()) => info!(team_id, cn, "ldap link added successfully"),
            Err(err) => warn!(team_id, cn, error = %format!("{err:#}"), "failed to add ldap link"),
        }
    }
}
