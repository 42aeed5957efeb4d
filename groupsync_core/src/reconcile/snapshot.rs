//! Per-pass backend snapshots.
//!
//! Fetching every user and team from a backend is the expensive part of a
//! reconcile, so each pass fetches at most once per backend and shares the
//! result between the membership diff and the removal path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connectors::{Connector, Team, User};

/// The backend-wide view a per-backend pass diffs against.
pub(crate) struct Snapshot {
    /// Users keyed by email, backend id populated
    pub users_by_email: HashMap<String, User>,
    /// Users keyed by backend id
    pub users_by_id: HashMap<String, User>,
    /// Teams keyed by backend-canonical name
    pub teams_by_name: HashMap<String, Team>,
}

/// Memoizes one [`Snapshot`] per backend key for the lifetime of a pass.
#[derive(Default)]
pub(crate) struct Preloader {
    snapshots: Mutex<HashMap<String, Arc<Snapshot>>>,
}

impl Preloader {
    /// Fetch (or reuse) the snapshot for one backend. When the backend's
    /// users are LDAP-synced the user maps stay empty and identifier
    /// matching falls back to the directory username.
    pub(crate) async fn load(
        &self,
        backend_key: &str,
        connector: &dyn Connector,
    ) -> Result<Arc<Snapshot>> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some(snapshot) = snapshots.get(backend_key) {
            return Ok(Arc::clone(snapshot));
        }

        let (users_by_email, users_by_id) = if connector.ldap_synced() {
            (HashMap::new(), HashMap::new())
        } else {
            connector
                .fetch_all_users()
                .await
                .context("fetching backend users")?
        };
        let teams_by_name = connector
            .fetch_all_teams()
            .await
            .context("fetching backend teams")?;
        debug!(
            backend_key,
            users = users_by_email.len(),
            teams = teams_by_name.len(),
            "preloaded backend snapshot"
        );

        let snapshot = Arc::new(Snapshot {
            users_by_email,
            users_by_id,
            teams_by_name,
        });
        snapshots.insert(backend_key.to_owned(), Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
