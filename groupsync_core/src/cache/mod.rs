//! Cache contract and driver selection.
//!
//! The cache is an opaque string key/value store. Two implementations sit
//! behind the same trait: a process-local TTL map and Redis. Values are
//! JSON-encoded strings written by the store layer; the cache itself never
//! interprets them.
//!
//! Single-key operations are internally synchronized. Multi-key
//! compositions (read-modify-write of store blobs) are ordered by the
//! process-wide lock owned by the reconciler and the offboarder, not here.

pub mod inmemory;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::CacheConfig;

/// Entry lifetime passed to [`Cache::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Never evict. Store entries use this: the reconciler and offboarder
    /// are the only things that remove them.
    Never,
    /// Use the driver's configured default TTL.
    Default,
    /// Evict after the given duration.
    After(Duration),
}

/// The contract both cache drivers implement.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value. `None` means the key is absent (or expired).
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value with the given lifetime.
    async fn set(&self, key: &str, value: String, ttl: Expiration) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch every live entry whose key matches a glob pattern
    /// (`*` and `?` wildcards, everything else literal).
    async fn get_by_pattern(&self, pattern: &str) -> Result<HashMap<String, String>>;
}

/// Build the cache selected by the configuration.
pub async fn new(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    match config.driver.as_str() {
        "memory" => Ok(Arc::new(inmemory::InMemoryCache::new(&config.inmemory))),
        "redis" => Ok(Arc::new(redis::RedisCache::connect(&config.redis).await?)),
        other => bail!("unknown cache driver: {other}"),
    }
}

/// Translate a glob pattern (`*`, `?`) into an anchored regex. Shared by
/// the in-memory driver; Redis applies the glob natively via `SCAN MATCH`.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr).map_err(anyhow::Error::from)
}
