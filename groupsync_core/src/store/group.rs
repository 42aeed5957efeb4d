//! Group sub-store: the consolidated record the reconciler commits.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, Expiration};
use crate::config::backend_key;

/// Backend metadata stored for a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend team id realising this group
    pub id: String,
    /// Backend instance name
    pub name: String,
    /// Backend type
    #[serde(rename = "type")]
    pub backend_type: String,
}

/// The consolidated value at `group:<name>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupData {
    /// Member emails after the last successful resolution
    #[serde(default)]
    pub members: Vec<String>,
    /// Backends the group is realised on, keyed by `backend_key`
    #[serde(default)]
    pub backends: HashMap<String, BackendInfo>,
}

/// Handles the `group:<name>` namespace.
#[derive(Clone)]
pub struct GroupStore {
    cache: Arc<dyn Cache>,
}

impl GroupStore {
    pub(super) fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn group_key(name: &str) -> String {
        format!("group:{name}")
    }

    /// The full group record. An absent group yields an empty record.
    pub async fn get(&self, name: &str) -> Result<GroupData> {
        let key = Self::group_key(name);
        match self.cache.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))
            }
            None => Ok(GroupData::default()),
        }
    }

    /// Replace the full group record.
    pub async fn set(&self, name: &str, data: &GroupData) -> Result<()> {
        let raw = serde_json::to_string(data).context("serializing group data")?;
        self.cache
            .set(&Self::group_key(name), raw, Expiration::Never)
            .await
    }

    /// Remove a group entirely.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.cache.delete(&Self::group_key(name)).await
    }

    /// Whether the group has a cached record.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.cache.get(&Self::group_key(name)).await?.is_some())
    }

    /// Member emails of a group.
    pub async fn get_members(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get(name).await?.members)
    }

    /// Replace the member list, preserving backends.
    pub async fn set_members(&self, name: &str, members: Vec<String>) -> Result<()> {
        let mut data = self.get(name).await?;
        data.members = members;
        self.set(name, &data).await
    }

    /// The backend map of a group.
    pub async fn get_backends(&self, name: &str) -> Result<HashMap<String, BackendInfo>> {
        Ok(self.get(name).await?.backends)
    }

    /// The team id realising a group on one backend; `None` when the
    /// backend is not recorded.
    pub async fn get_backend_id(
        &self,
        name: &str,
        backend_name: &str,
        backend_type: &str,
    ) -> Result<Option<String>> {
        let data = self.get(name).await?;
        Ok(data
            .backends
            .get(&backend_key(backend_name, backend_type))
            .map(|b| b.id.to_owned()))
    }

    /// Record (or update) one backend for a group.
    pub async fn set_backend(
        &self,
        name: &str,
        backend_name: &str,
        backend_type: &str,
        team_id: &str,
    ) -> Result<()> {
        let mut data = self.get(name).await?;
        data.backends.insert(
            backend_key(backend_name, backend_type),
            BackendInfo {
                id: team_id.to_owned(),
                name: backend_name.to_owned(),
                backend_type: backend_type.to_owned(),
            },
        );
        self.set(name, &data).await
    }

    /// Drop one backend from a group's record.
    pub async fn delete_backend(
        &self,
        name: &str,
        backend_name: &str,
        backend_type: &str,
    ) -> Result<()> {
        let mut data = self.get(name).await?;
        data.backends
            .remove(&backend_key(backend_name, backend_type));
        self.set(name, &data).await
    }

    /// Whether a group is recorded on one backend.
    pub async fn backend_exists(
        &self,
        name: &str,
        backend_name: &str,
        backend_type: &str,
    ) -> Result<bool> {
        let data = self.get(name).await?;
        Ok(data
            .backends
            .contains_key(&backend_key(backend_name, backend_type)))
    }

    /// All cached group records, keyed by group name. The removal path
    /// uses this to find other groups referencing a shared backend team.
    pub async fn get_all(&self) -> Result<HashMap<String, GroupData>> {
        let matches = self.cache.get_by_pattern("group:*").await?;
        let mut groups = HashMap::with_capacity(matches.len());
        for (key, raw) in matches {
            let name = key.trim_start_matches("group:");
            let data: GroupData =
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON at {key}"))?;
            groups.insert(name.to_owned(), data);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_helpers::memory_store;
    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_members_and_backends() -> Result<()> {
        let store = memory_store();
        let mut data = GroupData {
            members: vec!["alice@x.com".to_owned(), "bob@x.com".to_owned()],
            backends: HashMap::new(),
        };
        data.backends.insert(
            "fivetran-prod_fivetran".to_owned(),
            BackendInfo {
                id: "t-1".to_owned(),
                name: "fivetran-prod".to_owned(),
                backend_type: "fivetran".to_owned(),
            },
        );
        store.group.set("data-team", &data).await?;

        let read = store.group.get("data-team").await?;
        assert_eq!(read, data);
        Ok(())
    }

    #[tokio::test]
    async fn absent_group_reads_empty() -> Result<()> {
        let store = memory_store();
        let data = store.group.get("missing").await?;
        assert!(data.members.is_empty());
        assert!(data.backends.is_empty());
        assert!(!store.group.exists("missing").await?);
        Ok(())
    }

    #[tokio::test]
    async fn backend_accessors() -> Result<()> {
        let store = memory_store();
        store
            .group
            .set_backend("data-team", "fivetran-prod", "fivetran", "t-1")
            .await?;

        assert!(
            store
                .group
                .backend_exists("data-team", "fivetran-prod", "fivetran")
                .await?
        );
        assert_eq!(
            store
                .group
                .get_backend_id("data-team", "fivetran-prod", "fivetran")
                .await?,
            Some("t-1".to_owned())
        );

        store
            .group
            .delete_backend("data-team", "fivetran-prod", "fivetran")
            .await?;
        assert_eq!(
            store
                .group
                .get_backend_id("data-team", "fivetran-prod", "fivetran")
                .await?,
            None
        );
        Ok(())
    }

    #[tokio::test]
    async fn set_members_preserves_backends() -> Result<()> {
        let store = memory_store();
        store
            .group
            .set_backend("data-team", "fivetran-prod", "fivetran", "t-1")
            .await?;
        store
            .group
            .set_members("data-team", vec!["carol@x.com".to_owned()])
            .await?;

        let data = store.group.get("data-team").await?;
        assert_eq!(data.members, vec!["carol@x.com".to_owned()]);
        assert_eq!(data.backends.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_all_lists_every_group() -> Result<()> {
        let store = memory_store();
        store
            .group
            .set_backend("g1", "fivetran-prod", "fivetran", "t-1")
            .await?;
        store
            .group
            .set_backend("g2", "fivetran-prod", "fivetran", "t-1")
            .await?;

        let all = store.group.get_all().await?;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("g1") && all.contains_key("g2"));
        Ok(())
    }
}
