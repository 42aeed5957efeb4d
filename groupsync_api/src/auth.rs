//! Authentication middleware and CORS for the read API.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use groupsync_core::config::CorsConfig;

use crate::ApiState;

/// Reject requests that carry neither a known API key nor valid basic
/// credentials. Auth disabled in config lets everything through.
pub(crate) async fn require_auth<B>(
    Extension(state): Extension<Arc<ApiState>>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let auth = &state.config.auth;
    if !auth.enabled {
        return next.run(req).await;
    }

    if let Some(key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        if auth.api_keys.iter().any(|k| k == key) {
            return next.run(req).await;
        }
    }

    if let Some(basic) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(basic) {
            if let Ok(pair) = String::from_utf8(decoded) {
                if auth.basic_users.iter().any(|u| *u == pair) {
                    return next.run(req).await;
                }
            }
        }
    }

    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

/// Translate the configured CORS allowances into a layer. Unparseable
/// entries are skipped with a warning rather than failing startup.
pub(crate) fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new();

    layer = if config.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "skipping unparseable CORS origin");
                    None
                }
            })
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    };

    if config.allowed_methods.iter().any(|m| m == "*") {
        layer = layer.allow_methods(AllowMethods::any());
    } else if !config.allowed_methods.is_empty() {
        let methods: Vec<Method> = config
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer = layer.allow_methods(AllowMethods::list(methods));
    }

    if config.allowed_headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(AllowHeaders::any());
    } else if !config.allowed_headers.is_empty() {
        let headers: Vec<header::HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.allow_headers(AllowHeaders::list(headers));
    }

    layer
}
