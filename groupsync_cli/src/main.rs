//! groupsync binary: wires the configuration, the connectors, the
//! reconciler worker pool, the periodic offboarder, and the read API into
//! one process.

mod cmd;
mod groups_file;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::RwLock;

use groupsync_api::ApiState;
use groupsync_core::cache;
use groupsync_core::config::GroupsyncConfig;
use groupsync_core::connectors::ConnectorRegistry;
use groupsync_core::directory::{ldap::LdapDirectory, DirectoryClient};
use groupsync_core::logging::{self, info, warn};
use groupsync_core::offboarding::{PeriodicTaskManager, UserOffboardingJob};
use groupsync_core::reconcile::{GroupReconciler, WorkerPool};
use groupsync_core::resources::{InMemoryResources, ResourceClient};
use groupsync_core::store::Store;
use groupsync_core::transform::NameTransformer;
use groupsync_fivetran::FivetranConnector;
use groupsync_gitlab::GitlabConnector;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cmd::Args::parse();
    logging::setup(args.log_level);

    match args.command {
        cmd::Command::Validate { config } => validate(&config),
        cmd::Command::Serve { config, groups } => serve(&config, &groups).await,
    }
}

fn validate(config_path: &Path) -> Result<()> {
    let config = GroupsyncConfig::read_from_file(config_path)?;
    NameTransformer::from_config(&config.pattern).context("compiling name patterns")?;
    info!(
        app = %config.app.name,
        backends = config.backends.len(),
        "configuration is valid"
    );
    Ok(())
}

async fn serve(config_path: &Path, groups_dir: &Path) -> Result<()> {
    let config = GroupsyncConfig::read_from_file(config_path)?;
    info!(
        app = %config.app.name,
        version = %config.app.version,
        environment = %config.app.environment,
        "starting groupsync"
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let cache = cache::new(&config.cache).await?;
    let store = Store::new(cache);
    let cache_lock = Arc::new(RwLock::new(()));

    let mut registry = ConnectorRegistry::new(&config.backends);
    registry.register(
        groupsync_fivetran::BACKEND_TYPE,
        FivetranConnector::builder(config.http_client.to_owned()),
    );
    registry.register(
        groupsync_gitlab::BACKEND_TYPE,
        GitlabConnector::builder(config.http_client.to_owned()),
    );
    let registry = Arc::new(registry);

    let transformer =
        Arc::new(NameTransformer::from_config(&config.pattern).context("compiling name patterns")?);
    let directory: Arc<dyn DirectoryClient> = Arc::new(LdapDirectory::new(config.ldap.to_owned()));

    let (resources, events_rx) = InMemoryResources::new(256);
    let reconciler = Arc::new(GroupReconciler::new(
        Arc::clone(&resources) as Arc<dyn ResourceClient>,
        Arc::clone(&directory),
        Arc::clone(&registry),
        transformer,
        store.clone(),
        Arc::clone(&cache_lock),
    ));

    // seed the desired state from the groups directory; each apply
    // queues one event for the workers
    let declarations = groups_file::load_groups(groups_dir)?;
    info!(groups = declarations.len(), "loaded group declarations");
    for declaration in declarations {
        resources
            .apply(&declaration.name, declaration.spec)
            .await?;
    }

    let mut task_manager = PeriodicTaskManager::new();
    task_manager.add_task(Arc::new(UserOffboardingJob::new(
        store.clone(),
        Arc::clone(&directory),
        Arc::clone(&registry),
        Arc::clone(&cache_lock),
        &config.offboarding.skip_backend_types,
    )));
    let periodic_handles = task_manager.run_all();

    let api_state = Arc::new(ApiState {
        store,
        cache_lock,
        metrics: Some(metrics_handle),
        config: config.api_server.to_owned(),
    });
    let api_handle = tokio::spawn(async move {
        if let Err(err) = groupsync_api::serve(api_state).await {
            warn!(error = %format!("{err:#}"), "read api stopped");
        }
    });

    let pool = WorkerPool::new(reconciler, resources.event_sender());
    let workers = tokio::spawn(async move { pool.run(events_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    api_handle.abort();
    for handle in periodic_handles {
        handle.abort();
    }
    workers.abort();
    Ok(())
}
