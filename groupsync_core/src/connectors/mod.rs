//! Connectors module.
//!
//! The connector contract every managed backend implements, the shared
//! user/team types, and the registry that turns `(name, type)` pairs into
//! live connectors.

pub mod registry;
pub mod types;

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

pub use registry::ConnectorRegistry;
pub use types::{Team, User};

/// Sentinel error for HTTP 409 and equivalents: the user or team already
/// exists on the backend. Callers match it with
/// `err.downcast_ref::<Conflict>()` and recover by re-fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource already exists on backend")
    }
}

impl std::error::Error for Conflict {}

/// The trait all connectors are expected to implement.
///
/// Fetches return backend-local views; mutations are idempotent where the
/// wire protocol allows (deleting an already-absent team or user is a
/// success). Connectors whose users or membership are synced from the
/// directory advertise that through the sync flags and silently skip the
/// corresponding mutations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// All users known to the backend, as `(by_email, by_id)` maps with
    /// the backend user id populated on every entry.
    async fn fetch_all_users(&self) -> Result<(HashMap<String, User>, HashMap<String, User>)>;

    /// One user by backend id.
    async fn fetch_user_details(&self, user_id: &str) -> Result<User>;

    /// Create (or invite) a user. On conflict the connector resolves the
    /// existing record and returns it rather than failing; a bare
    /// [`Conflict`] error is the fallback when it cannot.
    async fn create_user(&self, user: &User) -> Result<User>;

    /// Remove a user from the backend.
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    /// All teams known to the backend, keyed by name.
    async fn fetch_all_teams(&self) -> Result<HashMap<String, Team>>;

    /// One team by backend id.
    async fn fetch_team_details(&self, team_id: &str) -> Result<Team>;

    /// Create a team; returns the created record with its id.
    async fn create_team(&self, team: &Team) -> Result<Team>;

    /// Delete a team. Deleting an already-absent team is a success.
    async fn delete_team_by_id(&self, team_id: &str) -> Result<()>;

    /// Current team membership, keyed by backend user id.
    async fn fetch_team_members(&self, team_id: &str) -> Result<HashMap<String, User>>;

    /// Add users to a team. An empty slice is a no-op.
    async fn add_users_to_team(&self, team_id: &str, user_ids: &[String]) -> Result<()>;

    /// Remove users from a team. An empty slice is a no-op.
    async fn remove_users_from_team(&self, team_id: &str, user_ids: &[String]) -> Result<()>;

    /// Mark the backend's user directory as LDAP-synced. `group_cn`
    /// carries the directory group the backend syncs from, when the
    /// backend needs it.
    fn set_ldap_sync(&mut self, enabled: bool, group_cn: Option<String>);

    /// Mark the backend's membership as SSO-managed.
    fn set_sso_sync(&mut self, enabled: bool);

    /// Whether users exist on the backend only via directory sync. When
    /// set, the reconciler neither creates users nor trusts the backend's
    /// user listing; identifiers fall back to the directory username.
    fn ldap_synced(&self) -> bool;

    /// Whether team membership is managed outside the reconciler.
    fn sso_synced(&self) -> bool;
}
