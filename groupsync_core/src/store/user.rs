//! User sub-store: which backends know a user, and under which id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{Cache, Expiration};

/// Handles the `user:<email>` namespace. The value is the map of
/// `backend_key -> backend_user_id` for every backend the user has been
/// onboarded to.
#[derive(Clone)]
pub struct UserStore {
    cache: Arc<dyn Cache>,
}

impl UserStore {
    pub(super) fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn user_key(email: &str) -> String {
        format!("user:{email}")
    }

    /// The backend id map for a user. An absent user yields an empty map,
    /// not an error.
    pub async fn get_backends(&self, email: &str) -> Result<HashMap<String, String>> {
        let key = Self::user_key(email);
        match self.cache.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))
            }
            None => Ok(HashMap::new()),
        }
    }

    /// Add or update one backend id for a user, creating the entry when the
    /// user is new.
    pub async fn set_backend(&self, email: &str, backend_key: &str, backend_id: &str) -> Result<()> {
        let mut backends = self.get_backends(email).await?;
        backends.insert(backend_key.to_owned(), backend_id.to_owned());

        let data = serde_json::to_string(&backends).context("serializing user backends")?;
        self.cache
            .set(&Self::user_key(email), data, Expiration::Never)
            .await
    }

    /// Remove one backend id from a user's record. Removing the last one
    /// drops the whole entry.
    pub async fn delete_backend(&self, email: &str, backend_key: &str) -> Result<()> {
        let key = Self::user_key(email);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(());
        };

        let mut backends: HashMap<String, String> =
            serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))?;
        backends.remove(backend_key);

        if backends.is_empty() {
            self.cache.delete(&key).await
        } else {
            let data = serde_json::to_string(&backends).context("serializing user backends")?;
            self.cache.set(&key, data, Expiration::Never).await
        }
    }

    /// Remove a user entirely.
    pub async fn delete(&self, email: &str) -> Result<()> {
        self.cache.delete(&Self::user_key(email)).await
    }

    /// Whether the user has any cached backend ids.
    pub async fn exists(&self, email: &str) -> Result<bool> {
        Ok(self.cache.get(&Self::user_key(email)).await?.is_some())
    }

    /// Search users by glob pattern on the email part of the key. The
    /// `user:` prefix is added here; `user:groups:*` reverse-index entries
    /// are excluded. Returns `email -> {backend_key -> backend_user_id}`;
    /// entries that fail to parse are skipped.
    pub async fn get_by_pattern(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        let matches = self.cache.get_by_pattern(&format!("user:{pattern}")).await?;

        let mut users = HashMap::with_capacity(matches.len());
        for (key, raw) in matches {
            let email = key.trim_start_matches("user:");
            if email.starts_with("groups:") {
                continue;
            }
            match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(backends) => {
                    users.insert(email.to_owned(), backends);
                }
                Err(_) => continue,
            }
        }
        Ok(users)
    }
}
