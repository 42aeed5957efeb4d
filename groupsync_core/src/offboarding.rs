//! Periodic background jobs, and the user offboarding sweep.
//!
//! The offboarder cross-references every cached user against the
//! directory once a day and revokes access on all but the explicitly
//! excluded backend types when the directory no longer knows the user.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::split_backend_key;
use crate::connectors::ConnectorRegistry;
use crate::directory::{is_not_found, DirectoryClient};
use crate::store::Store;
use crate::telemetry;

/// How long the task manager waits before the first tick of any task.
const WARMUP_DELAY: Duration = Duration::from_secs(10);

/// How often the user offboarding sweep runs.
pub const USER_OFFBOARDING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the user offboarding job, used as the metric controller tag.
pub const USER_OFFBOARDING_JOB_NAME: &str = "user_offboarding";

/// A timer-driven background job. One instance of each task runs at a
/// time; the manager's loop never overlaps ticks.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Unique task name for logs and metrics.
    fn name(&self) -> &str;
    /// Interval between runs.
    fn interval(&self) -> Duration;
    /// One run. Errors are logged and counted; the schedule continues.
    async fn run(&self) -> Result<()>;
}

/// Runs registered tasks on their intervals after a warmup delay.
#[derive(Default)]
pub struct PeriodicTaskManager {
    tasks: Vec<Arc<dyn PeriodicTask>>,
}

impl PeriodicTaskManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task.
    pub fn add_task(&mut self, task: Arc<dyn PeriodicTask>) {
        self.tasks.push(task);
    }

    /// Spawn every task's schedule loop. Returns the join handles so the
    /// caller can abort them on shutdown.
    pub fn run_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.tasks
            .iter()
            .map(|task| {
                let task = Arc::clone(task);
                tokio::spawn(async move {
                    info!(task = task.name(), "periodic task scheduled");
                    tokio::time::sleep(WARMUP_DELAY).await;
                    loop {
                        info!(task = task.name(), "periodic task starting");
                        let result = task.run().await;
                        telemetry::record_reconciliation(task.name(), result.as_ref().err());
                        match result {
                            Ok(()) => info!(task = task.name(), "periodic task finished"),
                            Err(err) => error!(
                                task = task.name(),
                                error = %format!("{err:#}"),
                                "periodic task failed; next tick retries"
                            ),
                        }
                        tokio::time::sleep(task.interval()).await;
                    }
                })
            })
            .collect()
    }
}

/// The user offboarding sweep (component H).
pub struct UserOffboardingJob {
    store: Store,
    directory: Arc<dyn DirectoryClient>,
    registry: Arc<ConnectorRegistry>,
    cache_lock: Arc<RwLock<()>>,
    skip_types: HashSet<String>,
}

impl UserOffboardingJob {
    /// Wire up the job. `skip_types` are backend types whose users are
    /// managed externally and must never be deleted here.
    pub fn new(
        store: Store,
        directory: Arc<dyn DirectoryClient>,
        registry: Arc<ConnectorRegistry>,
        cache_lock: Arc<RwLock<()>>,
        skip_types: &[String],
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            cache_lock,
            skip_types: skip_types.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    /// Offboard one directory-inactive user: delete from every
    /// non-excluded backend, then drop the cache records.
    async fn offboard_user(&self, user_id: &str) -> Result<()> {
        // user records are keyed by email; the directory id is the local
        // part, so the pattern search recovers the full key
        let users = {
            let _guard = self.cache_lock.read().await;
            self.store
                .user
                .get_by_pattern(&format!("{user_id}@*"))
                .await?
        };
        if users.is_empty() {
            info!(user_id, "no cached backend access, dropping from user list");
        }

        for (email, backends) in &users {
            for (key, backend_user_id) in backends {
                let (name, backend_type) = split_backend_key(key)?;
                if self.skip_types.contains(&backend_type.to_lowercase()) {
                    info!(
                        user_id,
                        backend = %key,
                        "backend type is excluded from offboarding, keeping access"
                    );
                    continue;
                }

                let connector = self
                    .registry
                    .build(name, backend_type)
                    .with_context(|| format!("building connector for {key}"))?;
                connector
                    .delete_user(backend_user_id)
                    .await
                    .with_context(|| format!("deleting user {email} from {key}"))?;
                info!(user_id, backend = %key, "removed user from backend");
            }
        }

        // all backends done; now drop the cache records in one locked
        // window
        let _guard = self.cache_lock.write().await;
        for email in users.keys() {
            self.store.user.delete(email).await?;
            self.store.user_groups.delete(email).await?;
        }
        let user_list = self.store.meta.get_user_list().await?;
        let remaining: Vec<String> = user_list.into_iter().filter(|u| u != user_id).collect();
        self.store.meta.set_user_list(&remaining).await?;

        info!(user_id, "user offboarded");
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for UserOffboardingJob {
    fn name(&self) -> &str {
        USER_OFFBOARDING_JOB_NAME
    }

    fn interval(&self) -> Duration {
        USER_OFFBOARDING_INTERVAL
    }

    async fn run(&self) -> Result<()> {
        let user_list = {
            let _guard = self.cache_lock.read().await;
            self.store.meta.get_user_list().await?
        };
        if user_list.is_empty() {
            info!("user list is empty, nothing to offboard");
            return Ok(());
        }
        info!(users = user_list.len(), "starting user offboarding sweep");

        let mut offboarded = 0usize;
        let mut errors: Vec<String> = Vec::new();
        for user_id in &user_list {
            match self.directory.get_user_data(user_id).await {
                Ok(_) => continue, // still active
                Err(err) if is_not_found(&err) => {
                    info!(%user_id, "user inactive in directory, offboarding");
                    match self.offboard_user(user_id).await {
                        Ok(()) => offboarded += 1,
                        Err(err) => {
                            warn!(%user_id, error = %format!("{err:#}"), "offboarding failed");
                            errors.push(format!("{user_id}: {err:#}"));
                        }
                    }
                }
                Err(err) => {
                    warn!(%user_id, error = %format!("{err:#}"), "directory check failed");
                    errors.push(format!("{user_id}: {err:#}"));
                }
            }
        }

        info!(
            total = user_list.len(),
            offboarded,
            errors = errors.len(),
            "user offboarding sweep finished"
        );
        if !errors.is_empty() {
            bail!(
                "user offboarding completed with {} errors: {}",
                errors.len(),
                errors.join("; ")
            );
        }
        Ok(())
    }
}
