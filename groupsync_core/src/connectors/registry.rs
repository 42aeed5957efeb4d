//! Connector registry.
//!
//! Backend types register a builder at startup; the reconciler and the
//! offboarder resolve `(name, type)` pairs into live connectors through
//! it. Resolution fails fast: unknown types, disabled backends, and
//! missing connection parameters surface before any backend call is made.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use super::Connector;
use crate::config::{backend_key, BackendConfig};

/// Builds a connector from its backend configuration.
pub type ConnectorBuilder =
    Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn Connector>> + Send + Sync>;

/// Resolves `(backend name, backend type)` into concrete connectors.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    builders: HashMap<String, ConnectorBuilder>,
    // type -> name -> config, enabled backends only
    backends: HashMap<String, HashMap<String, BackendConfig>>,
}

impl ConnectorRegistry {
    /// Index the enabled backends from configuration. Builders are added
    /// separately with [`register`](Self::register).
    pub fn new(backends: &[BackendConfig]) -> Self {
        let mut by_type: HashMap<String, HashMap<String, BackendConfig>> = HashMap::new();
        for backend in backends.iter().filter(|b| b.enabled) {
            by_type
                .entry(backend.backend_type.to_owned())
                .or_default()
                .insert(backend.name.to_owned(), backend.to_owned());
        }
        Self {
            builders: HashMap::new(),
            backends: by_type,
        }
    }

    /// Register the builder for a backend type. The last registration for
    /// a type wins.
    pub fn register(
        &mut self,
        backend_type: &str,
        builder: impl Fn(&BackendConfig) -> Result<Box<dyn Connector>> + Send + Sync + 'static,
    ) {
        self.builders
            .insert(backend_type.to_owned(), Arc::new(builder));
    }

    /// The configuration of an enabled backend, if declared.
    pub fn backend_config(&self, name: &str, backend_type: &str) -> Option<&BackendConfig> {
        self.backends.get(backend_type)?.get(name)
    }

    /// Every enabled backend, as `backend_key -> config`.
    pub fn enabled_backends(&self) -> HashMap<String, &BackendConfig> {
        self.backends
            .values()
            .flat_map(|by_name| by_name.values())
            .map(|config| (backend_key(&config.name, &config.backend_type), config))
            .collect()
    }

    /// Build a live connector for `(name, type)`.
    pub fn build(&self, name: &str, backend_type: &str) -> Result<Box<dyn Connector>> {
        let config = self.backend_config(name, backend_type).ok_or_else(|| {
            anyhow!("backend {backend_type}/{name} is not declared in configuration or is disabled")
        })?;
        let builder = self
            .builders
            .get(backend_type)
            .ok_or_else(|| anyhow!("no connector registered for backend type {backend_type}"))?;
        builder(config).with_context(|| format!("building connector for {backend_type}/{name}"))
    }
}

/// Fetch a required connection parameter, failing with the field name so
/// the resource status can surface it.
pub fn require_connection_param(config: &BackendConfig, key: &str) -> Result<String> {
    match config.connection.get(key) {
        Some(value) if !value.is_empty() => Ok(value.to_owned()),
        _ => bail!(
            "backend {}/{} is missing required connection field: {key}",
            config.backend_type,
            config.name
        ),
    }
}
