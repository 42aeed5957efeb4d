//! Offboarding a group from one backend.
//!
//! Runs when a backend disappears from a group's spec and, for every
//! backend, when the group itself is deleted. The backend team is deleted
//! only when no other cached group references the same team; otherwise
//! just this group's members are removed from it.

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::snapshot::Preloader;
use super::GroupReconciler;
use crate::config::backend_key;
use crate::resources::Backend;

impl GroupReconciler {
    /// Revoke one backend's realisation of a group. Succeeds when the
    /// backend no longer grants the group anything; the caller keeps the
    /// status entry (and retries) on error.
    pub(crate) async fn offboard_backend(
        &self,
        group_name: &str,
        backend: &Backend,
        preloader: &Preloader,
    ) -> Result<()> {
        let key = backend_key(&backend.name, &backend.backend_type);
        info!(group_name, backend = %key, "offboarding group from removed backend");

        let connector = self
            .registry
            .build(&backend.name, &backend.backend_type)
            .context("building connector for removed backend")?;

        // Find the team realising this group. Prefer the cached id; fall
        // back to a fresh lookup by transformed name.
        let team_id = match self
            .store
            .group
            .get_backend_id(group_name, &backend.name, &backend.backend_type)
            .await?
        {
            Some(id) => Some(id),
            None => {
                let team_name = self
                    .transformer
                    .transform(&backend.backend_type, group_name)?;
                let snapshot = preloader.load(&key, connector.as_ref()).await?;
                snapshot.teams_by_name.get(&team_name).map(|t| t.id.to_owned())
            }
        };

        let Some(team_id) = team_id else {
            // Nothing on the backend to revoke; just forget the backend.
            info!(group_name, backend = %key, "no team on backend, nothing to revoke");
            self.forget_backend(group_name, backend, &key).await?;
            return Ok(());
        };

        // Team existence persists while any other group references the
        // same team; deletion happens only when this is the last referent.
        let shared = self.team_shared_with_other_groups(group_name, &key, &team_id).await?;

        if shared {
            let members = self.store.group.get_members(group_name).await?;
            let mut member_ids = Vec::with_capacity(members.len());
            for email in &members {
                let backends = self.store.user.get_backends(email).await?;
                match backends.get(&key) {
                    Some(id) => member_ids.push(id.to_owned()),
                    None => {
                        warn!(group_name, %email, backend = %key, "no cached backend id for member")
                    }
                }
            }
            member_ids.sort();
            if !member_ids.is_empty() {
                info!(
                    group_name,
                    backend = %key,
                    count = member_ids.len(),
                    "team is shared, removing only this group's members"
                );
                connector
                    .remove_users_from_team(&team_id, &member_ids)
                    .await
                    .context("removing members from shared team")?;
            }
        } else {
            info!(group_name, backend = %key, %team_id, "deleting team from backend");
            connector
                .delete_team_by_id(&team_id)
                .await
                .context("deleting team")?;
        }

        self.forget_backend(group_name, backend, &key).await?;
        Ok(())
    }

    /// Whether any other cached group realises the same team on the same
    /// backend.
    async fn team_shared_with_other_groups(
        &self,
        group_name: &str,
        key: &str,
        team_id: &str,
    ) -> Result<bool> {
        let all = self.store.group.get_all().await?;
        Ok(all.iter().any(|(name, data)| {
            name != group_name
                && data
                    .backends
                    .get(key)
                    .map(|info| info.id == team_id)
                    .unwrap_or(false)
        }))
    }

    /// Drop the backend from the group's cached record once the backend no
    /// longer grants it anything.
    async fn forget_backend(&self, group_name: &str, backend: &Backend, key: &str) -> Result<()> {
        let _guard = self.cache_lock.write().await;
        self.store
            .group
            .delete_backend(group_name, &backend.name, &backend.backend_type)
            .await?;
        self.store.team.delete_backend(group_name, key).await?;
        Ok(())
    }
}
