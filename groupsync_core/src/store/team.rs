//! Team sub-store: which backends realise a team, and under which id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{Cache, Expiration};

/// Handles the `team:<name>` namespace. The value is the map of
/// `backend_key -> backend_team_id`.
#[derive(Clone)]
pub struct TeamStore {
    cache: Arc<dyn Cache>,
}

impl TeamStore {
    pub(super) fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn team_key(name: &str) -> String {
        format!("team:{name}")
    }

    /// The backend id map for a team. An absent team yields an empty map.
    pub async fn get_backends(&self, name: &str) -> Result<HashMap<String, String>> {
        let key = Self::team_key(name);
        match self.cache.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))
            }
            None => Ok(HashMap::new()),
        }
    }

    /// Add or update one backend id for a team.
    pub async fn set_backend(&self, name: &str, backend_key: &str, team_id: &str) -> Result<()> {
        let mut backends = self.get_backends(name).await?;
        backends.insert(backend_key.to_owned(), team_id.to_owned());

        let data = serde_json::to_string(&backends).context("serializing team backends")?;
        self.cache
            .set(&Self::team_key(name), data, Expiration::Never)
            .await
    }

    /// Remove one backend id from a team's record. Removing the last one
    /// drops the whole entry.
    pub async fn delete_backend(&self, name: &str, backend_key: &str) -> Result<()> {
        let key = Self::team_key(name);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(());
        };

        let mut backends: HashMap<String, String> =
            serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))?;
        backends.remove(backend_key);

        if backends.is_empty() {
            self.cache.delete(&key).await
        } else {
            let data = serde_json::to_string(&backends).context("serializing team backends")?;
            self.cache.set(&key, data, Expiration::Never).await
        }
    }

    /// Remove a team entirely.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.cache.delete(&Self::team_key(name)).await
    }

    /// Whether the team has any cached backend ids.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.cache.get(&Self::team_key(name)).await?.is_some())
    }
}
