//! The per-backend reconcile subroutine: ensure the team exists, ensure
//! every desired user exists, then diff and apply membership.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::snapshot::Preloader;
use super::GroupReconciler;
use crate::connectors::{Conflict, Connector, Team, User};

/// What a successful per-backend pass leaves behind for the store commit.
pub(crate) struct BackendPassResult {
    /// The team id realising the group on this backend
    pub team_id: String,
    /// Backend user id per member email
    pub member_ids: HashMap<String, String>,
}

impl GroupReconciler {
    /// Run one backend to convergence. Any error aborts this backend only;
    /// the caller records it on the status and moves on.
    pub(crate) async fn reconcile_backend(
        &self,
        backend_key: &str,
        connector: &dyn Connector,
        team_name: &str,
        members: &[User],
        preloader: &Preloader,
    ) -> Result<BackendPassResult> {
        let snapshot = preloader.load(backend_key, connector).await?;

        // Ensure the team exists.
        let team_id = match snapshot.teams_by_name.get(team_name) {
            Some(team) => team.id.to_owned(),
            None => {
                info!(backend_key, team_name, "team missing on backend, creating");
                let created = connector
                    .create_team(&Team {
                        id: String::new(),
                        name: team_name.to_owned(),
                        description: "managed by groupsync".to_owned(),
                        role: String::new(),
                    })
                    .await
                    .with_context(|| format!("creating team {team_name}"))?;
                if created.id.is_empty() {
                    bail!("backend returned a created team without an id");
                }
                created.id
            }
        };

        // Ensure each desired user exists on the backend and learn its
        // backend id. LDAP-synced backends manage users themselves; the
        // directory username doubles as the backend identifier there.
        let mut member_ids = HashMap::with_capacity(members.len());
        for user in members {
            if user.email.is_empty() {
                warn!(backend_key, uid = %user.id, "member has no email, skipping");
                continue;
            }
            let backend_id = if connector.ldap_synced() {
                if user.username.is_empty() {
                    user.id.to_owned()
                } else {
                    user.username.to_owned()
                }
            } else {
                match lookup_by_email(&snapshot.users_by_email, &user.email) {
                    Some(existing) => existing.id.to_owned(),
                    None => self.ensure_user(connector, user).await?,
                }
            };
            member_ids.insert(user.email.to_owned(), backend_id);
        }

        // Membership managed outside the reconciler: the team exists, the
        // users exist, and that is all we own.
        if connector.sso_synced() {
            debug!(backend_key, "membership is externally synced, skipping diff");
            return Ok(BackendPassResult {
                team_id,
                member_ids,
            });
        }

        // Diff current membership against desired and apply. Sets are
        // ordered so the issued calls are deterministic.
        let current: BTreeSet<String> = connector
            .fetch_team_members(&team_id)
            .await
            .with_context(|| format!("fetching members of team {team_name}"))?
            .into_keys()
            .collect();
        let desired: BTreeSet<String> = member_ids.values().cloned().collect();

        let to_add: Vec<String> = desired.difference(&current).cloned().collect();
        let to_remove: Vec<String> = current.difference(&desired).cloned().collect();

        if !to_add.is_empty() {
            info!(backend_key, team_name, count = to_add.len(), "adding members");
            connector
                .add_users_to_team(&team_id, &to_add)
                .await
                .with_context(|| format!("adding users to team {team_name}"))?;
        }
        if !to_remove.is_empty() {
            info!(
                backend_key,
                team_name,
                count = to_remove.len(),
                "removing members"
            );
            connector
                .remove_users_from_team(&team_id, &to_remove)
                .await
                .with_context(|| format!("removing users from team {team_name}"))?;
        }

        Ok(BackendPassResult {
            team_id,
            member_ids,
        })
    }

    /// Create a user on the backend, recovering the existing record when
    /// the backend reports a conflict.
    async fn ensure_user(&self, connector: &dyn Connector, user: &User) -> Result<String> {
        match connector.create_user(user).await {
            Ok(created) => Ok(created.id),
            Err(err) if err.downcast_ref::<Conflict>().is_some() => {
                info!(email = %user.email, "user already exists on backend, resolving");
                self.resolve_conflicted_user(connector, user).await
            }
            Err(err) => Err(err).with_context(|| format!("creating user {}", user.email)),
        }
    }

    /// The backend said "exists" but the preload did not see the user.
    /// Re-fetch and match, first by case-insensitive email, then by the
    /// username extracted from the email.
    async fn resolve_conflicted_user(
        &self,
        connector: &dyn Connector,
        user: &User,
    ) -> Result<String> {
        let (users_by_email, _) = connector
            .fetch_all_users()
            .await
            .context("re-fetching users after create conflict")?;

        if let Some(existing) = lookup_by_email(&users_by_email, &user.email) {
            return Ok(existing.id.to_owned());
        }

        let prefix = email_username(&user.email);
        let matched = users_by_email.values().find(|candidate| {
            candidate.username.eq_ignore_ascii_case(prefix)
                || email_username(&candidate.email).eq_ignore_ascii_case(prefix)
        });
        match matched {
            Some(existing) => Ok(existing.id.to_owned()),
            None => bail!(
                "user {} conflicted on create but was not found on re-fetch",
                user.email
            ),
        }
    }
}

/// Case-insensitive email lookup into a backend user map.
fn lookup_by_email<'a>(users: &'a HashMap<String, User>, email: &str) -> Option<&'a User> {
    users
        .get(email)
        .or_else(|| users.values().find(|u| u.email.eq_ignore_ascii_case(email)))
}

/// The local part of an email address.
fn email_username(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}
