//! Process-local TTL cache.
//!
//! A mutex-guarded map with lazy expiry on read plus a janitor task that
//! sweeps expired entries on the configured interval. Suitable for single
//! replica deployments and for tests; multi-replica deployments want the
//! Redis driver so all replicas see one store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{glob_to_regex, Cache, Expiration};
use crate::config::InMemoryCacheConfig;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// The in-memory driver.
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    default_ttl: Duration,
    janitor: Option<tokio::task::JoinHandle<()>>,
}

impl InMemoryCache {
    /// Create a cache and start its janitor on the configured interval.
    /// A zero `cleanup_interval_secs` disables the janitor; expired
    /// entries are then only dropped lazily on read.
    pub fn new(config: &InMemoryCacheConfig) -> Self {
        let entries: Arc<Mutex<HashMap<String, Entry>>> = Arc::default();
        let janitor = if config.cleanup_interval_secs > 0 {
            let sweep_entries = Arc::clone(&entries);
            let interval = Duration::from_secs(config.cleanup_interval_secs);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let now = Instant::now();
                    let mut entries = sweep_entries.lock();
                    let before = entries.len();
                    entries.retain(|_, e| !e.expired(now));
                    trace!(evicted = before - entries.len(), "cache janitor sweep");
                }
            }))
        } else {
            None
        };
        Self {
            entries,
            default_ttl: Duration::from_secs(config.default_expiration_secs),
            janitor,
        }
    }

    fn expires_at(&self, ttl: Expiration) -> Option<Instant> {
        match ttl {
            Expiration::Never => None,
            Expiration::Default => Some(Instant::now() + self.default_ttl),
            Expiration::After(d) => Some(Instant::now() + d),
        }
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expired(Instant::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.to_owned())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Expiration) -> Result<()> {
        let expires_at = self.expires_at(ttl);
        self.entries
            .lock()
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get_by_pattern(&self, pattern: &str) -> Result<HashMap<String, String>> {
        let re = glob_to_regex(pattern)?;
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(key, entry)| !entry.expired(now) && re.is_match(key))
            .map(|(key, entry)| (key.to_owned(), entry.value.to_owned()))
            .collect())
    }
}
