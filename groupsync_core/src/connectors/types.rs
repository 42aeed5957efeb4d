//! Shared user and team records passed across the connector contract.

use serde::{Deserialize, Serialize};

/// A user, either resolved from the directory or fetched from a backend.
/// `id` holds the directory identifier when the record comes from the
/// directory and the backend-local id when it comes from a connector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Directory uid or backend user id, depending on origin
    #[serde(default)]
    pub id: String,
    /// Primary email
    #[serde(default)]
    pub email: String,
    /// Directory username
    #[serde(default)]
    pub username: String,
    /// Given name
    #[serde(default)]
    pub first_name: String,
    /// Family name
    #[serde(default)]
    pub last_name: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Backend role, where the backend has one
    #[serde(default)]
    pub role: String,
}

/// A backend's local grouping primitive (team, role, subgroup).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Backend team id
    #[serde(default)]
    pub id: String,
    /// Team name on the backend
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Backend role granted through the team, where applicable
    #[serde(default)]
    pub role: String,
}
