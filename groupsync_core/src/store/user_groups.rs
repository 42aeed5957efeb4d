//! Reverse index: which groups a user belongs to.
//!
//! Answers "which groups does this user belong to?" without scanning every
//! `group:*` record.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{Cache, Expiration};

/// Handles the `user:groups:<email>` namespace. The value is the JSON
/// array of group names.
#[derive(Clone)]
pub struct UserGroupsStore {
    cache: Arc<dyn Cache>,
}

impl UserGroupsStore {
    pub(super) fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn user_groups_key(email: &str) -> String {
        format!("user:groups:{email}")
    }

    /// The groups a user belongs to. An absent user yields an empty list.
    pub async fn get_groups(&self, email: &str) -> Result<Vec<String>> {
        let key = Self::user_groups_key(email);
        match self.cache.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Add a group to a user's list, if not already present.
    pub async fn add_group(&self, email: &str, group_name: &str) -> Result<()> {
        let mut groups = self.get_groups(email).await?;
        if groups.iter().any(|g| g == group_name) {
            return Ok(());
        }
        groups.push(group_name.to_owned());
        self.set_groups(email, groups).await
    }

    /// Replace the full group list for a user.
    pub async fn set_groups(&self, email: &str, groups: Vec<String>) -> Result<()> {
        let data = serde_json::to_string(&groups).context("serializing user groups")?;
        self.cache
            .set(&Self::user_groups_key(email), data, Expiration::Never)
            .await
    }

    /// Remove a group from a user's list. Removing the last one drops the
    /// whole entry.
    pub async fn remove_group(&self, email: &str, group_name: &str) -> Result<()> {
        let groups = self.get_groups(email).await?;
        if groups.is_empty() {
            return Ok(());
        }

        let remaining: Vec<String> = groups.into_iter().filter(|g| g != group_name).collect();
        if remaining.is_empty() {
            self.cache.delete(&Self::user_groups_key(email)).await
        } else {
            self.set_groups(email, remaining).await
        }
    }

    /// Remove the user's reverse-index entry entirely.
    pub async fn delete(&self, email: &str) -> Result<()> {
        self.cache.delete(&Self::user_groups_key(email)).await
    }

    /// Whether the user appears in any group.
    pub async fn exists(&self, email: &str) -> Result<bool> {
        Ok(self
            .cache
            .get(&Self::user_groups_key(email))
            .await?
            .is_some())
    }
}
