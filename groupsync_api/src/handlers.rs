//! Route handlers over the cache views.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::ApiState;

/// A user's backend id map.
#[derive(Serialize)]
pub(crate) struct UserResponse {
    email: String,
    backends: std::collections::HashMap<String, String>,
}

/// A user's reverse-index entry.
#[derive(Serialize)]
pub(crate) struct UserGroupsResponse {
    email: String,
    groups: Vec<String>,
}

fn internal_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

pub(crate) async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Ready when the cache answers.
pub(crate) async fn readyz(Extension(state): Extension<Arc<ApiState>>) -> Response {
    let _guard = state.cache_lock.read().await;
    match state.store.meta.get_user_list().await {
        Ok(_) => Json(json!({"status": "ready"})).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

pub(crate) async fn metrics(Extension(state): Extension<Arc<ApiState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

pub(crate) async fn user_backends(
    Extension(state): Extension<Arc<ApiState>>,
    Path(email): Path<String>,
) -> Response {
    let _guard = state.cache_lock.read().await;
    match state.store.user.get_backends(&email).await {
        Ok(backends) if backends.is_empty() => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "user not found"}))).into_response()
        }
        Ok(backends) => Json(UserResponse { email, backends }).into_response(),
        Err(err) => internal_error(err),
    }
}

pub(crate) async fn user_groups(
    Extension(state): Extension<Arc<ApiState>>,
    Path(email): Path<String>,
) -> Response {
    let _guard = state.cache_lock.read().await;
    match state.store.user_groups.get_groups(&email).await {
        Ok(groups) => Json(UserGroupsResponse { email, groups }).into_response(),
        Err(err) => internal_error(err),
    }
}

pub(crate) async fn group(
    Extension(state): Extension<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    let _guard = state.cache_lock.read().await;
    match state.store.group.exists(&name).await {
        Ok(false) => {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "group not found"})))
                .into_response()
        }
        Err(err) => return internal_error(err),
        Ok(true) => (),
    }
    match state.store.group.get(&name).await {
        Ok(data) => Json(json!({"name": name, "members": data.members, "backends": data.backends}))
            .into_response(),
        Err(err) => internal_error(err),
    }
}

pub(crate) async fn team(
    Extension(state): Extension<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    let _guard = state.cache_lock.read().await;
    match state.store.team.get_backends(&name).await {
        Ok(backends) if backends.is_empty() => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "team not found"}))).into_response()
        }
        Ok(backends) => Json(json!({"name": name, "backends": backends})).into_response(),
        Err(err) => internal_error(err),
    }
}
