//! Meta sub-store: small bookkeeping values, notably the offboarder's
//! user list.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{Cache, Expiration};

/// Handles the `meta:<key>` namespace.
#[derive(Clone)]
pub struct MetaStore {
    cache: Arc<dyn Cache>,
}

const USER_LIST: &str = "user_list";

impl MetaStore {
    pub(super) fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn meta_key(key: &str) -> String {
        format!("meta:{key}")
    }

    /// The directory ids of every user that has ever appeared as a group
    /// member; the superset the offboarder sweeps. Absent list reads
    /// empty.
    pub async fn get_user_list(&self) -> Result<Vec<String>> {
        let key = Self::meta_key(USER_LIST);
        match self.cache.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Replace the user list.
    pub async fn set_user_list(&self, users: &[String]) -> Result<()> {
        let data = serde_json::to_string(users).context("serializing user list")?;
        self.cache
            .set(&Self::meta_key(USER_LIST), data, Expiration::Never)
            .await
    }

    /// Fetch a generic metadata value. Unlike the typed accessors, an
    /// absent key here is an error: generic callers must know whether a
    /// default makes sense.
    pub async fn get(&self, key: &str) -> Result<String> {
        let meta_key = Self::meta_key(key);
        self.cache
            .get(&meta_key)
            .await?
            .with_context(|| format!("meta key not found: {key}"))
    }

    /// Store a generic metadata value.
    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        self.cache
            .set(&Self::meta_key(key), value, Expiration::Never)
            .await
    }

    /// Remove a metadata entry.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.delete(&Self::meta_key(key)).await
    }
}
