//! Prefixed, JSON-serializing store facade over the cache.
//!
//! Sub-stores and their key namespaces:
//!
//! | Sub-store | Key | Value |
//! |---|---|---|
//! | user | `user:<email>` | `{backend_key: backend_user_id}` |
//! | team | `team:<name>` | `{backend_key: backend_team_id}` |
//! | group | `group:<name>` | `{members: [email], backends: {backend_key: {id,name,type}}}` |
//! | meta | `meta:<key>` | arbitrary; `meta:user_list` is `[directory_id]` |
//! | user_groups | `user:groups:<email>` | `[group_name]` |
//!
//! The store does NOT lock. Every compound read-modify-write here is
//! atomic only under the process-wide writer lock held by the reconciler
//! and the offboarder around their commit windows.

mod group;
mod meta;
mod team;
mod user;
mod user_groups;

use std::sync::Arc;

pub use group::{BackendInfo, GroupData, GroupStore};
pub use meta::MetaStore;
pub use team::TeamStore;
pub use user::UserStore;
pub use user_groups::UserGroupsStore;

use crate::cache::Cache;

/// The store facade. Cheap to clone; all sub-stores share one cache.
#[derive(Clone)]
pub struct Store {
    /// `user:*` namespace
    pub user: UserStore,
    /// `team:*` namespace
    pub team: TeamStore,
    /// `group:*` namespace
    pub group: GroupStore,
    /// `meta:*` namespace
    pub meta: MetaStore,
    /// `user:groups:*` reverse index
    pub user_groups: UserGroupsStore,
}

impl Store {
    /// Create a store with all sub-stores bound to the given cache.
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            user: UserStore::new(Arc::clone(&cache)),
            team: TeamStore::new(Arc::clone(&cache)),
            group: GroupStore::new(Arc::clone(&cache)),
            meta: MetaStore::new(Arc::clone(&cache)),
            user_groups: UserGroupsStore::new(cache),
        }
    }
}
