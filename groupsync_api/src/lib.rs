//! Read-only exploration of the groupsync cache over HTTP.
//!
//! Serves the store views the reconciler maintains: which backends know a
//! user, which groups a user belongs to, and what a group or team looks
//! like. Everything is read-under-shared-lock; nothing here mutates.

mod auth;
mod handlers;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Extension, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use groupsync_core::config::ApiServerConfig;
use groupsync_core::logging::info;
use groupsync_core::store::Store;

/// Shared state behind every handler.
pub struct ApiState {
    /// The store the reconciler writes
    pub store: Store,
    /// The process-wide lock; handlers take it shared
    pub cache_lock: Arc<RwLock<()>>,
    /// Prometheus render handle, when the exporter is installed
    pub metrics: Option<PrometheusHandle>,
    /// Auth settings applied by the middleware
    pub config: ApiServerConfig,
}

/// Build the application router.
pub fn router(state: Arc<ApiState>) -> Router {
    let api = Router::new()
        .route("/user/:email", get(handlers::user_backends))
        .route("/user/:email/groups", get(handlers::user_groups))
        .route("/group/:name", get(handlers::group))
        .route("/team/:name", get(handlers::team))
        .route_layer(middleware::from_fn(auth::require_auth));

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .layer(auth::cors_layer(&state.config.cors))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Serve the read API until the process exits.
pub async fn serve(state: Arc<ApiState>) -> Result<()> {
    let addr = SocketAddr::from_str(&format!(
        "{}:{}",
        state.config.host, state.config.port
    ))
    .context("invalid api server address")?;
    info!("read api listening on {addr}");

    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await
        .context("api server failed")
}
