//! Redis-backed cache driver.
//!
//! One multiplexed connection shared by all clones. Pattern reads go
//! through `SCAN MATCH` so large keyspaces never block the server the way
//! `KEYS` would.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;

use super::{Cache, Expiration};
use crate::config::RedisCacheConfig;

/// The Redis driver.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    /// Open a multiplexed connection to the configured server.
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let url = if config.password.is_empty() {
            format!("redis://{}:{}/{}", config.host, config.port, config.database)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                config.password, config.host, config.port, config.database
            )
        };
        let client = redis::Client::open(url).context("invalid redis connection settings")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }

    fn ttl_seconds(ttl: Expiration) -> Option<u64> {
        match ttl {
            // The store writes with Never; entries live until the
            // reconciler or offboarder removes them.
            Expiration::Never | Expiration::Default => None,
            Expiration::After(d) => Some(d.max(Duration::from_secs(1)).as_secs()),
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .with_context(|| format!("redis GET {key}"))
    }

    async fn set(&self, key: &str, value: String, ttl: Expiration) -> Result<()> {
        let mut conn = self.conn.clone();
        match Self::ttl_seconds(ttl) {
            Some(secs) => conn
                .set_ex(key, value, secs)
                .await
                .with_context(|| format!("redis SETEX {key}")),
            None => conn
                .set(key, value)
                .await
                .with_context(|| format!("redis SET {key}")),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn
            .del(key)
            .await
            .with_context(|| format!("redis DEL {key}"))?;
        Ok(())
    }

    async fn get_by_pattern(&self, pattern: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(pattern)
                .await
                .with_context(|| format!("redis SCAN MATCH {pattern}"))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let values: Vec<Option<String>> = conn
            .get(keys.to_owned())
            .await
            .context("redis MGET for pattern scan")?;

        // A key can expire between SCAN and MGET; skip those.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }
}
