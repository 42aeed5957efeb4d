//! The group reconciler.
//!
//! One pass takes a `Group` resource from desired state to converged
//! backends: resolve members against the directory, offboard backends
//! that left the spec, drive every declared backend to the desired team
//! and membership, write the per-backend outcomes to the status, and
//! commit the observed state to the store.
//!
//! Failure discipline: one backend's failure never aborts another's. The
//! pass returns a top-level error only when a pre-backend step fails or
//! every backend failed; everything else is captured per backend in the
//! status and retried on the next pass.

mod backend;
mod removal;
mod snapshot;
mod worker;

pub use worker::WorkerPool;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::backend_key;
use crate::connectors::{ConnectorRegistry, User};
use crate::directory::{is_not_found, DirectoryClient};
use crate::resources::{
    Backend, BackendStatus, GenerationConflict, Group, GroupStatus, ResourceClient,
};
use crate::store::{BackendInfo, Store};
use crate::telemetry;
use crate::transform::NameTransformer;

use backend::BackendPassResult;
use snapshot::Preloader;

/// Metric tag for this controller.
const CONTROLLER: &str = "group";

/// Requeue delay after captured failures.
const REQUEUE_ON_ERROR: Duration = Duration::from_secs(30);

/// Requeue delay after losing a status-write race to a newer generation.
const REQUEUE_ON_CONFLICT: Duration = Duration::from_secs(5);

/// What the caller should do after a pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Re-run the pass after this long; `None` means converged.
    pub requeue_after: Option<Duration>,
}

/// The core reconciliation loop (component G).
pub struct GroupReconciler {
    resources: Arc<dyn ResourceClient>,
    directory: Arc<dyn DirectoryClient>,
    registry: Arc<ConnectorRegistry>,
    transformer: Arc<NameTransformer>,
    store: Store,
    cache_lock: Arc<RwLock<()>>,
}

/// Everything one backend's slice of a pass produced.
struct BackendRun {
    backend: Backend,
    status: BackendStatus,
    pass: Option<BackendPassResult>,
}

impl GroupReconciler {
    /// Wire up a reconciler. `cache_lock` is the process-wide writer lock
    /// shared with the offboarder.
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        directory: Arc<dyn DirectoryClient>,
        registry: Arc<ConnectorRegistry>,
        transformer: Arc<NameTransformer>,
        store: Store,
        cache_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            resources,
            directory,
            registry,
            transformer,
            store,
            cache_lock,
        }
    }

    /// Run one reconcile pass for the named group, reporting metrics on
    /// the way out.
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let result = self.reconcile_inner(name).await;
        telemetry::record_reconciliation(CONTROLLER, result.as_ref().err());
        result
    }

    async fn reconcile_inner(&self, name: &str) -> Result<ReconcileOutcome> {
        // 1. Fetch desired state; absence and deletion markers both mean
        // terminal cleanup.
        let group = match self.resources.get(name).await? {
            None => return self.delete_group(name, None).await,
            Some(group) if group.is_deleting() => {
                return self.delete_group(name, Some(&group)).await
            }
            Some(group) => group,
        };
        let logical_name = logical_name(&group);
        info!(
            group = name,
            generation = group.generation,
            backends = group.spec.backends.len(),
            "reconciling group"
        );

        // 2. Resolve desired members against the directory.
        let resolved = self.resolve_members(&group).await?;

        let preloader = Preloader::default();

        // 3. Backends that were healthy in the previous status but left
        // the spec get offboarded before the current spec is driven. The
        // store record catches removals that failed on an earlier pass:
        // those entries sit in the status with status=false, but stay in
        // `group:<name>.backends` until the revoke finally lands.
        let mut removed = removed_backends(&group);
        for info in self.store.group.get_backends(logical_name).await?.values() {
            let in_spec = group
                .spec
                .backends
                .iter()
                .any(|b| b.name == info.name && b.backend_type == info.backend_type);
            let already_queued = removed
                .iter()
                .any(|b| b.name == info.name && b.backend_type == info.backend_type);
            if !in_spec && !already_queued {
                removed.push(Backend {
                    name: info.name.to_owned(),
                    backend_type: info.backend_type.to_owned(),
                });
            }
        }
        let mut removal_failures = Vec::new();
        for backend in &removed {
            if let Err(err) = self
                .offboard_backend(logical_name, backend, &preloader)
                .await
            {
                warn!(
                    group = name,
                    backend = %backend_key(&backend.name, &backend.backend_type),
                    error = %format!("{err:#}"),
                    "offboarding removed backend failed, keeping it in status"
                );
                removal_failures.push(BackendStatus {
                    name: backend.name.to_owned(),
                    backend_type: backend.backend_type.to_owned(),
                    status: false,
                    message: format!("offboarding failed: {err:#}"),
                });
            }
        }

        // 4. Drive every backend in the current spec, dependants after
        // their dependencies, everything else concurrently.
        let runs = self
            .run_backends(&group, logical_name, &resolved, &preloader)
            .await;

        // 5. Write status: current-spec outcomes plus removals that still
        // need a retry.
        let mut backends_status: Vec<BackendStatus> =
            runs.iter().map(|run| run.status.to_owned()).collect();
        backends_status.extend(removal_failures.iter().cloned());
        let status = GroupStatus {
            backends_status,
            observed_generation: group.generation,
        };
        match self.resources.update_status(name, status).await {
            Ok(()) => (),
            Err(err) if err.downcast_ref::<GenerationConflict>().is_some() => {
                info!(group = name, "spec changed mid-reconcile, requeueing");
                return Ok(ReconcileOutcome {
                    requeue_after: Some(REQUEUE_ON_CONFLICT),
                });
            }
            Err(err) => return Err(err).context("writing group status"),
        }

        // 6. Commit the observed state to the store.
        self.commit_stores(logical_name, &resolved, &runs).await?;

        // 7. Decide the verdict.
        let failed = runs.iter().filter(|run| !run.status.status).count();
        if !runs.is_empty() && failed == runs.len() {
            bail!("all {} backends failed to reconcile", runs.len());
        }
        if failed > 0 || !removal_failures.is_empty() {
            return Ok(ReconcileOutcome {
                requeue_after: Some(REQUEUE_ON_ERROR),
            });
        }
        info!(group = name, members = resolved.len(), "group converged");
        Ok(ReconcileOutcome::default())
    }

    /// Expand declared users, nested groups, and the optional directory
    /// query into resolved users. Unknown identifiers are skipped with a
    /// warning; directory transport errors abort the pass.
    async fn resolve_members(&self, group: &Group) -> Result<Vec<User>> {
        let mut identifiers: BTreeSet<String> =
            group.spec.members.users.iter().cloned().collect();

        // nested groups expand transitively; cycles are cut by the
        // visited set
        let mut queue: VecDeque<String> = group.spec.members.groups.iter().cloned().collect();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(group.name.to_owned());
        while let Some(nested) = queue.pop_front() {
            if !visited.insert(nested.to_owned()) {
                continue;
            }
            match self.resources.get(&nested).await? {
                Some(nested_group) => {
                    identifiers.extend(nested_group.spec.members.users.iter().cloned());
                    queue.extend(nested_group.spec.members.groups.iter().cloned());
                }
                None => warn!(group = %group.name, %nested, "nested group not found, skipping"),
            }
        }

        if let Some(query) = group.spec.ldap_query.as_deref() {
            let members = self
                .directory
                .get_query_members(query)
                .await
                .context("expanding ldap query")?;
            identifiers.extend(members);
        }

        let mut resolved = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            match self.directory.get_user_data(&identifier).await {
                Ok(user) => resolved.push(user),
                Err(err) if is_not_found(&err) => {
                    warn!(%identifier, "user not found in directory, skipping");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("directory lookup for {identifier}"))
                }
            }
        }
        Ok(resolved)
    }

    /// Run the per-backend subroutine for every backend in the spec.
    /// Backends whose dependency is also in the spec wait for it to
    /// succeed; within a wave backends run concurrently.
    async fn run_backends(
        &self,
        group: &Group,
        logical_name: &str,
        members: &[User],
        preloader: &Preloader,
    ) -> Vec<BackendRun> {
        let mut runs: Vec<BackendRun> = Vec::new();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<Backend> = group.spec.backends.to_owned();

        while !remaining.is_empty() {
            let mut ready = Vec::new();
            let mut blocked = Vec::new();
            for backend in remaining.drain(..) {
                let deps = self.backend_dependencies(group, &backend);
                if let Some(bad) = deps.iter().find(|d| failed.contains(*d)) {
                    let key = backend_key(&backend.name, &backend.backend_type);
                    failed.insert(key);
                    runs.push(BackendRun {
                        status: BackendStatus {
                            name: backend.name.to_owned(),
                            backend_type: backend.backend_type.to_owned(),
                            status: false,
                            message: format!("dependency {bad} did not succeed"),
                        },
                        backend,
                        pass: None,
                    });
                } else if deps.iter().all(|d| succeeded.contains(d)) {
                    ready.push(backend);
                } else {
                    blocked.push(backend);
                }
            }

            if ready.is_empty() {
                // the remaining backends wait on something that will
                // never finish (cycle, or a dependency outside the spec)
                for backend in blocked {
                    runs.push(BackendRun {
                        status: BackendStatus {
                            name: backend.name.to_owned(),
                            backend_type: backend.backend_type.to_owned(),
                            status: false,
                            message: "unsatisfiable backend dependency".to_owned(),
                        },
                        backend,
                        pass: None,
                    });
                }
                break;
            }

            let wave = join_all(
                ready
                    .into_iter()
                    .map(|backend| self.run_backend(backend, logical_name, members, preloader)),
            )
            .await;
            for run in wave {
                let key = backend_key(&run.backend.name, &run.backend.backend_type);
                if run.status.status {
                    succeeded.insert(key);
                } else {
                    failed.insert(key);
                }
                runs.push(run);
            }
            remaining = blocked;
        }
        runs
    }

    /// One backend's slice of the pass: build the connector, transform
    /// the name, reconcile. Every failure is captured into the status
    /// entry.
    async fn run_backend(
        &self,
        backend: Backend,
        logical_name: &str,
        members: &[User],
        preloader: &Preloader,
    ) -> BackendRun {
        let key = backend_key(&backend.name, &backend.backend_type);
        let result: Result<BackendPassResult> = async {
            let connector = self.registry.build(&backend.name, &backend.backend_type)?;
            let team_name = self
                .transformer
                .transform(&backend.backend_type, logical_name)?;
            self.reconcile_backend(&key, connector.as_ref(), &team_name, members, preloader)
                .await
        }
        .await;

        match result {
            Ok(pass) => BackendRun {
                status: BackendStatus {
                    name: backend.name.to_owned(),
                    backend_type: backend.backend_type.to_owned(),
                    status: true,
                    message: "Successful".to_owned(),
                },
                backend,
                pass: Some(pass),
            },
            Err(err) => {
                warn!(backend = %key, error = %format!("{err:#}"), "backend reconcile failed");
                BackendRun {
                    status: BackendStatus {
                        name: backend.name.to_owned(),
                        backend_type: backend.backend_type.to_owned(),
                        status: false,
                        message: format!("{err:#}"),
                    },
                    backend,
                    pass: None,
                }
            }
        }
    }

    /// The backend keys this backend must wait for: its configured
    /// `depends_on` plus the spec's `dependencies` list (for every
    /// backend not itself listed there). Only dependencies that are in
    /// the spec count.
    fn backend_dependencies(&self, group: &Group, backend: &Backend) -> Vec<String> {
        let in_spec = |name: &str, backend_type: &str| {
            group
                .spec
                .backends
                .iter()
                .any(|b| b.name == name && b.backend_type == backend_type)
        };

        let mut deps = BTreeSet::new();
        if let Some(config) = self
            .registry
            .backend_config(&backend.name, &backend.backend_type)
        {
            if let Some(dep) = &config.depends_on {
                if in_spec(&dep.name, &dep.backend_type)
                    && (dep.name != backend.name || dep.backend_type != backend.backend_type)
                {
                    deps.insert(backend_key(&dep.name, &dep.backend_type));
                }
            }
        }
        if !group.spec.dependencies.contains(backend) {
            for dep in &group.spec.dependencies {
                if in_spec(&dep.name, &dep.backend_type) && dep != backend {
                    deps.insert(backend_key(&dep.name, &dep.backend_type));
                }
            }
        }
        deps.into_iter().collect()
    }

    /// Step 6: rewrite the group record, user backend ids, reverse index
    /// and user list under one acquisition of the shared write lock.
    async fn commit_stores(
        &self,
        logical_name: &str,
        resolved: &[User],
        runs: &[BackendRun],
    ) -> Result<()> {
        let _guard = self.cache_lock.write().await;

        let prev = self.store.group.get(logical_name).await?;
        let mut data = prev.to_owned();

        data.members = resolved
            .iter()
            .filter(|u| !u.email.is_empty())
            .map(|u| u.email.to_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for run in runs.iter().filter(|run| run.status.status) {
            let key = backend_key(&run.backend.name, &run.backend.backend_type);
            let Some(pass) = &run.pass else { continue };
            data.backends.insert(
                key.to_owned(),
                BackendInfo {
                    id: pass.team_id.to_owned(),
                    name: run.backend.name.to_owned(),
                    backend_type: run.backend.backend_type.to_owned(),
                },
            );
            self.store
                .team
                .set_backend(logical_name, &key, &pass.team_id)
                .await?;
            for (email, backend_user_id) in &pass.member_ids {
                self.store
                    .user
                    .set_backend(email, &key, backend_user_id)
                    .await?;
            }
        }
        self.store.group.set(logical_name, &data).await?;

        // reverse index: add current members, drop departed ones
        let current: HashSet<&String> = data.members.iter().collect();
        for email in &data.members {
            self.store.user_groups.add_group(email, logical_name).await?;
        }
        for email in prev.members.iter().filter(|m| !current.contains(m)) {
            self.store
                .user_groups
                .remove_group(email, logical_name)
                .await?;
        }

        // the offboarder sweeps every directory id that ever appeared as
        // a member
        let mut user_list = self.store.meta.get_user_list().await?;
        let known: HashSet<String> = user_list.iter().cloned().collect();
        for user in resolved {
            if !user.id.is_empty() && !known.contains(&user.id) {
                user_list.push(user.id.to_owned());
            }
        }
        self.store.meta.set_user_list(&user_list).await?;

        Ok(())
    }

    /// Terminal cleanup: offboard every realised backend, then drop the
    /// group's store records and release the finalizer.
    async fn delete_group(
        &self,
        name: &str,
        group: Option<&Group>,
    ) -> Result<ReconcileOutcome> {
        let logical_name = group.map(logical_name).unwrap_or(name);
        info!(group = name, "group deleted, offboarding all backends");

        // Union of what the status says was healthy and what the store
        // says was realised; either alone can be stale.
        let mut backends: HashMap<String, Backend> = HashMap::new();
        if let Some(group) = group {
            for entry in group.status.backends_status.iter().filter(|e| e.status) {
                backends.insert(
                    backend_key(&entry.name, &entry.backend_type),
                    Backend {
                        name: entry.name.to_owned(),
                        backend_type: entry.backend_type.to_owned(),
                    },
                );
            }
        }
        for info in self.store.group.get_backends(logical_name).await?.values() {
            backends.insert(
                backend_key(&info.name, &info.backend_type),
                Backend {
                    name: info.name.to_owned(),
                    backend_type: info.backend_type.to_owned(),
                },
            );
        }

        let preloader = Preloader::default();
        let mut failures = Vec::new();
        for backend in backends.values() {
            if let Err(err) = self
                .offboard_backend(logical_name, backend, &preloader)
                .await
            {
                warn!(
                    group = name,
                    backend = %backend_key(&backend.name, &backend.backend_type),
                    error = %format!("{err:#}"),
                    "offboarding during deletion failed"
                );
                failures.push(BackendStatus {
                    name: backend.name.to_owned(),
                    backend_type: backend.backend_type.to_owned(),
                    status: false,
                    message: format!("offboarding failed: {err:#}"),
                });
            }
        }

        if !failures.is_empty() {
            if let Some(group) = group {
                let status = GroupStatus {
                    backends_status: failures.to_owned(),
                    observed_generation: group.generation,
                };
                if let Err(err) = self.resources.update_status(name, status).await {
                    if err.downcast_ref::<GenerationConflict>().is_none() {
                        return Err(err).context("writing group status during deletion");
                    }
                }
            }
            bail!("offboarding failed for {} backends", failures.len());
        }

        {
            let _guard = self.cache_lock.write().await;
            let members = self.store.group.get_members(logical_name).await?;
            for email in &members {
                self.store
                    .user_groups
                    .remove_group(email, logical_name)
                    .await?;
            }
            self.store.group.delete(logical_name).await?;
            self.store.team.delete(logical_name).await?;
        }

        if group.is_some() {
            self.resources
                .remove_finalizer(name)
                .await
                .context("releasing finalizer")?;
        }
        info!(group = name, "group cleanup complete");
        Ok(ReconcileOutcome::default())
    }
}

/// The logical name store keys and backend team names derive from.
fn logical_name(group: &Group) -> &str {
    if group.spec.group_name.is_empty() {
        &group.name
    } else {
        &group.spec.group_name
    }
}

/// Backends healthy in the previous status but absent from the current
/// spec. Status is the source of truth: a status cleared out-of-band
/// means nothing is detected here.
fn removed_backends(group: &Group) -> Vec<Backend> {
    group
        .status
        .backends_status
        .iter()
        .filter(|entry| entry.status)
        .filter(|entry| {
            !group
                .spec
                .backends
                .iter()
                .any(|b| b.name == entry.name && b.backend_type == entry.backend_type)
        })
        .map(|entry| Backend {
            name: entry.name.to_owned(),
            backend_type: entry.backend_type.to_owned(),
        })
        .collect()
}

#[cfg(test)]
mod tests;
