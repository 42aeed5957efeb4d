//! Directory client contract.
//!
//! The directory (LDAP) is the authoritative, read-only source of user
//! existence. The reconciler resolves declared member identifiers through
//! it; the offboarder uses it to decide who has left.

pub mod ldap;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::connectors::User;

/// Sentinel error: the identifier has no active directory entry. The
/// reconciler skips such users; the offboarder revokes their access.
/// Matched with `err.downcast_ref::<NotFound>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound;

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no active user found in directory")
    }
}

impl std::error::Error for NotFound {}

/// Whether an error (possibly wrapped in context) is the directory
/// NotFound sentinel.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotFound>().is_some()
}

/// The directory-query contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Look up one active user by identifier. Returns the resolved user
    /// with `id` set to the directory identifier, or a [`NotFound`] error.
    async fn get_user_data(&self, identifier: &str) -> Result<User>;

    /// Expand a directory filter into member identifiers. An empty filter
    /// yields no members.
    async fn get_query_members(&self, filter: &str) -> Result<Vec<String>>;
}
