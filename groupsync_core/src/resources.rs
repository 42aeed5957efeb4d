//! The declarative `Group` resource and the client contract for the
//! object store that holds it.
//!
//! The reconciler subscribes to change events keyed by the resource name
//! and mutates only the status. The store behind the contract is whatever
//! the deployment provides; the in-memory implementation here backs tests
//! and single-process runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

/// A `(name, type)` backend reference in a group spec.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backend {
    /// Backend instance name
    pub name: String,
    /// Backend type
    #[serde(rename = "type")]
    pub backend_type: String,
}

/// Desired members of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembers {
    /// Directory identifiers
    #[serde(default)]
    pub users: Vec<String>,
    /// Nested logical groups, expanded transitively
    #[serde(default)]
    pub groups: Vec<String>,
}

/// The desired state declared by the operator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Logical group name
    pub group_name: String,
    /// Desired members
    #[serde(default)]
    pub members: GroupMembers,
    /// Backends the group must exist on
    #[serde(default)]
    pub backends: Vec<Backend>,
    /// Optional directory filter expanding to additional members
    #[serde(default)]
    pub ldap_query: Option<String>,
    /// Backends every other backend must wait for within a reconcile
    #[serde(default)]
    pub dependencies: Vec<Backend>,
}

/// Per-backend outcome written back to the resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    /// Backend instance name
    pub name: String,
    /// Backend type
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Whether the last pass succeeded for this backend
    pub status: bool,
    /// Human-readable outcome
    #[serde(default)]
    pub message: String,
}

/// The reconciled state written back to the resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// One entry per backend the reconciler has touched
    #[serde(default)]
    pub backends_status: Vec<BackendStatus>,
    /// The generation the status reflects
    #[serde(default)]
    pub observed_generation: i64,
}

/// One `Group` record: metadata, spec, status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Cluster-unique resource name
    pub name: String,
    /// Monotonic spec version, bumped by the operator on every change
    pub generation: i64,
    /// Set when the operator has requested deletion; cleanup runs before
    /// the finalizer releases the record
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
    /// Desired state
    pub spec: GroupSpec,
    /// Reconciled state
    #[serde(default)]
    pub status: GroupStatus,
}

impl Group {
    /// Whether this record is being deleted.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Sentinel error: the record's generation moved while a reconcile was in
/// flight. The worker requeues instead of clobbering the newer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConflict;

impl fmt::Display for GenerationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource generation changed during reconcile")
    }
}

impl std::error::Error for GenerationConflict {}

/// A change notification for one group resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEvent {
    /// The resource name the event refers to
    pub name: String,
}

/// Client contract for the object store holding `Group` records.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch a record by name. `None` means deleted (or never created).
    async fn get(&self, name: &str) -> Result<Option<Group>>;

    /// Write the status subresource. `observed_generation` must equal the
    /// record's current generation or the write fails with
    /// [`GenerationConflict`].
    async fn update_status(&self, name: &str, status: GroupStatus) -> Result<()>;

    /// Release the record after terminal cleanup; the store may then drop
    /// it entirely.
    async fn remove_finalizer(&self, name: &str) -> Result<()>;
}

/// In-memory resource store. Feeds events to the worker pool; tests and
/// single-process deployments use it directly.
pub struct InMemoryResources {
    records: RwLock<HashMap<String, Group>>,
    events: mpsc::Sender<GroupEvent>,
}

impl InMemoryResources {
    /// Create the store and the event receiver the worker pool consumes.
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<GroupEvent>) {
        let (events, rx) = mpsc::channel(buffer);
        (
            Arc::new(Self {
                records: RwLock::new(HashMap::new()),
                events,
            }),
            rx,
        )
    }

    /// The sender side of the event channel, for requeueing work.
    pub fn event_sender(&self) -> mpsc::Sender<GroupEvent> {
        self.events.clone()
    }

    /// Create or update a record, bumping its generation, and emit an
    /// event.
    pub async fn apply(&self, name: &str, spec: GroupSpec) -> Result<()> {
        {
            let mut records = self.records.write().await;
            let record = records.entry(name.to_owned()).or_insert_with(|| Group {
                name: name.to_owned(),
                ..Default::default()
            });
            record.generation += 1;
            record.spec = spec;
        }
        self.notify(name).await
    }

    /// Mark a record for deletion and emit an event. The record stays
    /// visible (with its deletion timestamp set) until the finalizer is
    /// removed.
    pub async fn mark_deleted(&self, name: &str) -> Result<()> {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(name) {
                record.deletion_timestamp = Some("deleted".to_owned());
            }
        }
        self.notify(name).await
    }

    async fn notify(&self, name: &str) -> Result<()> {
        self.events
            .send(GroupEvent {
                name: name.to_owned(),
            })
            .await
            .map_err(|_| anyhow!("event channel closed"))
    }
}

#[async_trait]
impl ResourceClient for InMemoryResources {
    async fn get(&self, name: &str) -> Result<Option<Group>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn update_status(&self, name: &str, status: GroupStatus) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| anyhow!("resource not found: {name}"))?;
        if record.generation != status.observed_generation {
            return Err(anyhow!(GenerationConflict));
        }
        record.status = status;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        self.records.write().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn apply_bumps_generation_and_notifies() -> Result<()> {
        let (resources, mut rx) = InMemoryResources::new(8);
        resources
            .apply("data-team", GroupSpec::default())
            .await?;
        resources
            .apply("data-team", GroupSpec::default())
            .await?;

        let record = resources.get("data-team").await?.unwrap();
        assert_eq!(record.generation, 2);
        assert_eq!(rx.recv().await.unwrap().name, "data-team");
        assert_eq!(rx.recv().await.unwrap().name, "data-team");
        Ok(())
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() -> Result<()> {
        let (resources, _rx) = InMemoryResources::new(8);
        resources.apply("data-team", GroupSpec::default()).await?;
        resources.apply("data-team", GroupSpec::default()).await?;

        let err = resources
            .update_status(
                "data-team",
                GroupStatus {
                    backends_status: vec![],
                    observed_generation: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<GenerationConflict>().is_some());

        resources
            .update_status(
                "data-team",
                GroupStatus {
                    backends_status: vec![],
                    observed_generation: 2,
                },
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn deletion_marks_then_finalizer_drops() -> Result<()> {
        let (resources, _rx) = InMemoryResources::new(8);
        resources.apply("data-team", GroupSpec::default()).await?;
        resources.mark_deleted("data-team").await?;

        let record = resources.get("data-team").await?.unwrap();
        assert!(record.is_deleting());

        resources.remove_finalizer("data-team").await?;
        assert!(resources.get("data-team").await?.is_none());
        Ok(())
    }
}
