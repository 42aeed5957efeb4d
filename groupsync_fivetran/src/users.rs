//! User operations against the Fivetran API.

use anyhow::{Context, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use groupsync_core::connectors::User;

use crate::rest::{ApiError, FivetranRestClient};

#[derive(Deserialize)]
pub(crate) struct FivetranUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl From<FivetranUser> for User {
    fn from(u: FivetranUser) -> Self {
        let username = u.email.split('@').next().unwrap_or_default().to_owned();
        User {
            id: u.id,
            email: u.email,
            username,
            first_name: u.given_name,
            last_name: u.family_name,
            display_name: String::new(),
            role: u.role.unwrap_or_default(),
        }
    }
}

impl FivetranRestClient {
    /// All users on the account, across every page.
    pub(crate) async fn list_users(&self) -> Result<Vec<User>> {
        let users: Vec<FivetranUser> = self
            .get_paginated("users")
            .await
            .context("fetching list of users")?;
        info!(total_user_count = users.len(), "found users");
        Ok(users.into_iter().map(User::from).collect())
    }

    /// Invite a user to the account. A conflict bubbles up as an
    /// [`ApiError`] for the caller to resolve against the existing
    /// record.
    pub(crate) async fn invite_user(&self, user: &User) -> Result<User> {
        info!(email = %user.email, "inviting user");
        let body = json!({
            "email": user.email,
            "given_name": user.first_name,
            "family_name": user.last_name,
        });
        let created: FivetranUser = self
            .request(Method::POST, "users", Some(body))
            .await
            .context("inviting the user")?;
        Ok(created.into())
    }

    /// One user by id.
    pub(crate) async fn user_details(&self, user_id: &str) -> Result<User> {
        let user: FivetranUser = self
            .request(Method::GET, &format!("users/{user_id}"), None)
            .await
            .context("fetching user details")?;
        Ok(user.into())
    }

    /// Remove a user from the account. Already-absent users are a
    /// success.
    pub(crate) async fn remove_user(&self, user_id: &str) -> Result<()> {
        info!(user_id, "deleting user");
        match self
            .request_no_content(Method::DELETE, &format!("users/{user_id}"), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(err)
                if err
                    .downcast_ref::<ApiError>()
                    .map(ApiError::is_not_found)
                    .unwrap_or(false) =>
            {
                info!(user_id, "user already absent");
                Ok(())
            }
            Err(err) => Err(err).context("deleting the user"),
        }
    }
}
