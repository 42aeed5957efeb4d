//! Groupsync configuration
//!
//! The configuration file enumerates the application identity, the LDAP
//! directory connection, the cache driver, the managed backends with their
//! connection parameters, the per-backend-type name patterns, and the read
//! API server settings.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use yaml_peg::serde as yaml;

/// Application identity, used in logs and metric prefixes.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct App {
    /// Application name
    pub name: String,
    /// Application version
    pub version: String,
    /// Deployment environment (dev, stage, prod)
    #[serde(default)]
    pub environment: String,
}

/// Connection settings for the LDAP directory.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct LdapConfig {
    /// LDAP server URL, e.g. `ldaps://ldap.corp.example.com:636`
    pub server: String,
    /// Base DN under which user entries live
    pub base_dn: String,
    /// Template used to build a user DN from an identifier, e.g. `uid=%s,ou=users`
    #[serde(default)]
    pub user_dn_template: String,
    /// Search filter used to look up a single user, `%s` replaced by the identifier
    pub user_search_filter: String,
    /// Attributes requested for each user entry
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Cache driver selection.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct CacheConfig {
    /// `memory` or `redis`
    pub driver: String,
    /// Settings for the process-local cache
    #[serde(default)]
    pub inmemory: InMemoryCacheConfig,
    /// Settings for the external cache
    #[serde(default)]
    pub redis: RedisCacheConfig,
}

/// Process-local cache settings (seconds).
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct InMemoryCacheConfig {
    /// Default TTL applied when callers pass `Expiration::Default`
    pub default_expiration_secs: u64,
    /// How often expired entries are evicted
    pub cleanup_interval_secs: u64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            default_expiration_secs: 3600,
            cleanup_interval_secs: 600,
        }
    }
}

/// External cache settings.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct RedisCacheConfig {
    /// Redis host
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Redis logical database
    #[serde(default)]
    pub database: i64,
    /// Redis password, empty for none
    #[serde(default)]
    pub password: String,
}

/// Outbound HTTP client tuning shared by the REST connectors.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct HttpClientConfig {
    /// Connection pool settings
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    /// Circuit breaker settings
    #[serde(default)]
    pub hystrix: HystrixConfig,
}

/// Connection pool settings (seconds).
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct ConnectionPoolConfig {
    /// Connect timeout
    pub timeout_secs: u64,
    /// TCP keep-alive
    pub keep_alive_secs: u64,
    /// Max idle connections kept per host
    pub max_idle_connections: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            keep_alive_secs: 30,
            max_idle_connections: 10,
        }
    }
}

/// Circuit breaker settings (milliseconds where noted).
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct HystrixConfig {
    /// Max in-flight requests per backend
    pub max_concurrent_requests: u32,
    /// Requests before the breaker evaluates
    pub request_volume_threshold: u32,
    /// How long an open breaker sleeps before probing, ms
    pub sleep_window_ms: u64,
    /// Error percentage that opens the breaker
    pub error_percent_threshold: u32,
    /// Per-request timeout, ms
    pub timeout_ms: u64,
}

impl Default for HystrixConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_volume_threshold: 20,
            sleep_window_ms: 5000,
            error_percent_threshold: 50,
            timeout_ms: 30_000,
        }
    }
}

/// A managed backend and its connection parameters.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct BackendConfig {
    /// Backend instance name, unique within its type
    pub name: String,
    /// Backend type, used to pick the connector implementation
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Disabled backends are never built
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connector-specific connection parameters
    #[serde(default)]
    pub connection: HashMap<String, String>,
    /// Optional backend this one must wait for within a group reconcile
    #[serde(default)]
    pub depends_on: Option<BackendRef>,
}

fn default_enabled() -> bool {
    true
}

/// A `(name, type)` reference to another backend.
#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq, Eq, Hash)]
pub struct BackendRef {
    /// Backend instance name
    pub name: String,
    /// Backend type
    #[serde(rename = "type")]
    pub backend_type: String,
}

/// One rewrite rule of the name transformer.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct PatternPair {
    /// Regex matched against the logical group name
    pub input: String,
    /// Replacement template; capture groups expand with `$1`, `$name`
    pub output: String,
}

/// Periodic offboarding settings.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct OffboardingConfig {
    /// Backend types whose users are managed externally and must never be
    /// deleted by the offboarder
    pub skip_backend_types: Vec<String>,
}

impl Default for OffboardingConfig {
    fn default() -> Self {
        Self {
            skip_backend_types: vec!["gitlab".to_owned()],
        }
    }
}

/// Read API server settings.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct ApiServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Authentication settings
    #[serde(default)]
    pub auth: ApiAuthConfig,
    /// CORS settings
    #[serde(default)]
    pub cors: CorsConfig,
}

/// Read API authentication.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct ApiAuthConfig {
    /// Whether auth is enforced at all
    #[serde(default)]
    pub enabled: bool,
    /// Accepted `X-API-Key` values
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Accepted `user:password` pairs for basic auth
    #[serde(default)]
    pub basic_users: Vec<String>,
}

/// CORS allowances for the read API.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct CorsConfig {
    /// Allowed origins
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    #[serde(default)]
    pub allowed_headers: Vec<String>,
}

/// Struct representing the groupsync_config.yaml file.
#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct GroupsyncConfig {
    /// Application identity
    pub app: App,
    /// Directory connection
    pub ldap: LdapConfig,
    /// Cache driver and settings
    pub cache: CacheConfig,
    /// Outbound HTTP tuning
    #[serde(default)]
    pub http_client: HttpClientConfig,
    /// All managed backends
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Name transformer patterns, keyed by backend type or `default`
    #[serde(default)]
    pub pattern: HashMap<String, Vec<PatternPair>>,
    /// Periodic offboarding settings
    #[serde(default)]
    pub offboarding: OffboardingConfig,
    /// Read API server settings
    #[serde(default)]
    pub api_server: ApiServerConfig,
}

impl GroupsyncConfig {
    /// Use the given filepath to ingest the groupsync config.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<GroupsyncConfig> {
        let config_raw = fs::read_to_string(&path).context("Reading file")?;
        let mut config =
            yaml::from_str::<GroupsyncConfig>(&config_raw).context("Deserializing config")?;
        let config = config.pop().context("empty configuration file")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the rest of the system assumes.
    pub fn validate(&self) -> Result<()> {
        if self.app.name.is_empty() {
            bail!("app.name must be set");
        }
        match self.cache.driver.as_str() {
            "memory" => (),
            "redis" => {
                if self.cache.redis.host.is_empty() {
                    bail!("cache.redis.host must be set when the redis driver is selected");
                }
            }
            other => bail!("unknown cache driver: {other}"),
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() || backend.backend_type.is_empty() {
                bail!("every backend needs both a name and a type");
            }
            if !seen.insert((backend.name.to_owned(), backend.backend_type.to_owned())) {
                bail!(
                    "duplicate backend declared: {}/{}",
                    backend.backend_type,
                    backend.name
                );
            }
        }
        Ok(())
    }

    /// Look up a backend's configuration by `(name, type)`. Disabled
    /// backends are invisible here, matching the connector registry.
    pub fn backend(&self, name: &str, backend_type: &str) -> Option<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.enabled && b.name == name && b.backend_type == backend_type)
    }

    /// Convert this config to a yaml string.
    pub fn to_yaml(&self) -> Result<String> {
        yaml::to_string(self).map_err(anyhow::Error::from)
    }
}

/// Composite key identifying one backend instance in store values and
/// status maps: `"<name>_<type>"`.
pub fn backend_key(name: &str, backend_type: &str) -> String {
    format!("{name}_{backend_type}")
}

/// Split a composite backend key back into `(name, type)`. The type never
/// contains an underscore, names may.
pub fn split_backend_key(key: &str) -> Result<(&str, &str)> {
    key.rsplit_once('_')
        .with_context(|| format!("malformed backend key: {key}"))
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"
app:
  name: groupsync
  version: 0.2.0
  environment: test
ldap:
  server: ldap://ldap.test.example.com:389
  base_dn: ou=users,dc=example,dc=com
  user_search_filter: (uid=%s)
  attributes: [uid, mail, cn, sn, givenName]
cache:
  driver: memory
backends:
  - name: fivetran-prod
    type: fivetran
    connection:
      api_key: key
      api_secret: secret
  - name: gitlab-prod
    type: gitlab
    enabled: false
    connection:
      token: glpat-test
pattern:
  default:
    - input: "(.*)"
      output: "$1"
"#;

    #[test]
    fn parse_config_works() -> Result<()> {
        let mut parsed = yaml::from_str::<GroupsyncConfig>(CONFIG)?;
        let config = parsed.pop().unwrap();
        config.validate()?;
        assert_eq!(config.app.name, "groupsync");
        assert_eq!(config.backends.len(), 2);
        assert!(config.backend("fivetran-prod", "fivetran").is_some());
        // disabled backends are not resolvable
        assert!(config.backend("gitlab-prod", "gitlab").is_none());
        assert!(config.backend("nope", "fivetran").is_none());
        Ok(())
    }

    #[test]
    fn validate_rejects_unknown_driver() {
        let config = GroupsyncConfig {
            app: App {
                name: "groupsync".to_owned(),
                version: "0.0.0".to_owned(),
                environment: String::new(),
            },
            cache: CacheConfig {
                driver: "memcached".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_key_round_trips() -> Result<()> {
        let key = backend_key("fivetran-prod", "fivetran");
        assert_eq!(key, "fivetran-prod_fivetran");
        let (name, backend_type) = split_backend_key(&key)?;
        assert_eq!(name, "fivetran-prod");
        assert_eq!(backend_type, "fivetran");

        // names may themselves contain underscores
        let (name, backend_type) = split_backend_key("data_platform_snowflake")?;
        assert_eq!(name, "data_platform");
        assert_eq!(backend_type, "snowflake");
        Ok(())
    }
}
