//! Team and membership operations against the Fivetran API.

use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use groupsync_core::connectors::{Team, User};

use crate::rest::{ApiError, FivetranRestClient};

/// Role granted to teams the reconciler creates.
pub(crate) const ACCOUNT_REVIEWER_ROLE: &str = "Account Reviewer";

/// Role granted to members the reconciler adds.
pub(crate) const TEAM_MEMBER_ROLE: &str = "Team Member";

#[derive(Deserialize)]
pub(crate) struct FivetranTeam {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl From<FivetranTeam> for Team {
    fn from(t: FivetranTeam) -> Self {
        Team {
            id: t.id,
            name: t.name,
            description: t.description,
            role: t.role.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct TeamMembership {
    user_id: String,
    #[serde(default)]
    role: Option<String>,
}

impl FivetranRestClient {
    /// All teams on the account, across every page.
    pub(crate) async fn list_teams(&self) -> Result<Vec<Team>> {
        let teams: Vec<FivetranTeam> = self
            .get_paginated("teams")
            .await
            .context("fetching list of teams")?;
        info!(total_teams_count = teams.len(), "found teams");
        Ok(teams.into_iter().map(Team::from).collect())
    }

    /// Create a team; an empty role falls back to account reviewer.
    pub(crate) async fn create_team(&self, team: &Team) -> Result<Team> {
        let role = if team.role.is_empty() {
            ACCOUNT_REVIEWER_ROLE
        } else {
            &team.role
        };
        info!(name = %team.name, role, "creating team");
        let body = json!({
            "name": team.name,
            "role": role,
            "description": team.description,
        });
        let created: FivetranTeam = self
            .request(Method::POST, "teams", Some(body))
            .await
            .context("creating the team")?;
        Ok(created.into())
    }

    /// One team by id.
    pub(crate) async fn team_details(&self, team_id: &str) -> Result<Team> {
        let team: FivetranTeam = self
            .request(Method::GET, &format!("teams/{team_id}"), None)
            .await
            .context("fetching team details")?;
        Ok(team.into())
    }

    /// Delete a team. Already-absent teams are a success.
    pub(crate) async fn remove_team(&self, team_id: &str) -> Result<()> {
        info!(team_id, "deleting the team");
        match self
            .request_no_content(Method::DELETE, &format!("teams/{team_id}"), None)
            .await
        {
            Ok(()) => {
                info!(team_id, "team deleted successfully");
                Ok(())
            }
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

    /// Current members of a team, keyed by backend user id.
    pub(crate) async fn team_members(&self, team_id: &str) -> Result<HashMap<String, User>> {
        let memberships: Vec<TeamMembership> = self
            .get_paginated(&format!("teams/{team_id}/users"))
            .await
            .context("fetching team members")?;
        Ok(memberships
            .into_iter()
            .map(|m| {
                let user = User {
                    id: m.user_id.to_owned(),
                    role: m.role.unwrap_or_default(),
                    ..Default::default()
                };
                (m.user_id, user)
            })
            .collect())
    }

    /// Add users to a team one membership at a time; a conflict means the
    /// user is already in and counts as done.
    pub(crate) async fn add_team_members(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        for user_id in user_ids {
            let body = json!({ "user_id": user_id, "role": TEAM_MEMBER_ROLE });
            match self
                .request_no_content(Method::POST, &format!("teams/{team_id}/users"), Some(body))
                .await
            {
                Ok(()) => info!(team_id, %user_id, "added user to team"),
                Err(err)
                    if err
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_conflict)
                        .unwrap_or(false) =>
                {
                    info!(team_id, %user_id, "user already in team");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("adding user {user_id} to team {team_id}"))
                }
            }
        }
        Ok(())
    }

    /// Remove users from a team one membership at a time; already-absent
    /// memberships count as done.
    pub(crate) async fn remove_team_members(
        &self,
        team_id: &str,
        user_ids: &[String],
    ) -> Result<()> {
        for user_id in user_ids {
            match self
                .request_no_content(
                    Method::DELETE,
                    &format!("teams/{team_id}/users/{user_id}"),
                    None,
                )
                .await
            {
                Ok(()) => info!(team_id, %user_id, "removed user from team"),
                Err(err)
                    if err
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_not_found)
                        .unwrap_or(false) =>
                {
                    info!(team_id, %user_id, "user already out of team");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing user {user_id} from team {team_id}"))
                }
            }
        }
        Ok(())
    }
}
