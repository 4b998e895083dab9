//! Configuration Module
//!
//! Handles loading cache configuration from environment variables and
//! validating the eviction policy.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::KeyScheme;
use crate::error::{CacheError, Result};
use crate::store::Backoff;

/// Default byte budget per document in a capped collection.
pub const DEFAULT_CAPPED_ENTRY_BYTES: u64 = 16 * 1024;

// == Eviction Policy ==
/// The single eviction policy a cache instance runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Entries expire `ttl` after they are written; a TTL index sweeps them.
    Expiry { ttl: Duration },
    /// The collection is capped at `max_entries` documents.
    Capacity { max_entries: u64 },
}

impl EvictionPolicy {
    pub fn is_capacity(&self) -> bool {
        matches!(self, EvictionPolicy::Capacity { .. })
    }
}

/// Cache configuration parameters.
///
/// Exactly one of `ttl` and `max_entries` must be set.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// MongoDB host
    pub host: String,
    /// MongoDB port
    pub port: u16,
    /// Database holding the cache collection
    pub database: String,
    /// Cache collection name
    pub collection: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Authentication database, defaults to the driver's choice
    pub auth_source: Option<String>,
    /// Expiry policy: default entry lifetime in seconds
    pub ttl: Option<u64>,
    /// Capacity policy: maximum number of documents.
    ///
    /// A capped collection is also bounded in bytes, at
    /// `max_entries * capped_entry_bytes`. Whichever bound is hit first
    /// evicts, so entries larger than `capped_entry_bytes` on average are
    /// evicted before `max_entries` is reached. Overwrites and deletes on a
    /// capped collection leave an expired document behind, which also
    /// counts against both bounds until it is evicted.
    pub max_entries: Option<u64>,
    /// Capacity policy: byte budget per document when sizing a new capped
    /// collection. Has no effect on an existing collection.
    pub capped_entry_bytes: u64,
    /// Fraction of entries culled when over capacity (1/n), 0 clears
    pub cull_frequency: u32,
    pub key_prefix: String,
    pub key_version: i64,
    pub key_scheme: KeyScheme,
    /// Attempts per store call, including the first
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds, 0 retries immediately
    pub retry_backoff_ms: u64,
    /// MongoDB server selection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Maintenance task interval in seconds
    pub cull_interval: u64,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_HOST` - MongoDB host (default: localhost)
    /// - `CACHE_PORT` - MongoDB port (default: 27017)
    /// - `CACHE_DATABASE` - Database name (default: cache)
    /// - `CACHE_COLLECTION` - Collection name (default: cache_entries)
    /// - `CACHE_USERNAME`, `CACHE_PASSWORD`, `CACHE_AUTH_SOURCE` - Credentials (default: unset)
    /// - `CACHE_TTL` - Expiry policy in seconds (default: unset)
    /// - `CACHE_MAX_ENTRIES` - Capacity policy (default: unset)
    /// - `CACHE_CAPPED_ENTRY_BYTES` - Capped size per entry (default: 16384)
    /// - `CACHE_CULL_FREQUENCY` - Cull divisor (default: 3)
    /// - `CACHE_KEY_PREFIX` - Key prefix (default: empty)
    /// - `CACHE_KEY_VERSION` - Default key version (default: 1)
    /// - `CACHE_KEY_SCHEME` - `substitute`, `strip` or `escape` (default: substitute)
    /// - `CACHE_RETRY_ATTEMPTS` - Attempts per store call (default: 3)
    /// - `CACHE_RETRY_BACKOFF_MS` - Delay between retries (default: 0)
    /// - `CACHE_CONNECT_TIMEOUT_MS` - Server selection timeout (default: 5000)
    /// - `CACHE_CULL_INTERVAL` - Maintenance interval in seconds (default: 60)
    ///
    /// Neither policy variable has a default, so an empty environment yields
    /// a config that [`policy`](Self::policy) rejects.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env::var("CACHE_HOST").unwrap_or(defaults.host),
            port: parse_var("CACHE_PORT").unwrap_or(defaults.port),
            database: env::var("CACHE_DATABASE").unwrap_or(defaults.database),
            collection: env::var("CACHE_COLLECTION").unwrap_or(defaults.collection),
            username: env::var("CACHE_USERNAME").ok(),
            password: env::var("CACHE_PASSWORD").ok(),
            auth_source: env::var("CACHE_AUTH_SOURCE").ok(),
            ttl: parse_var("CACHE_TTL"),
            max_entries: parse_var("CACHE_MAX_ENTRIES"),
            capped_entry_bytes: parse_var("CACHE_CAPPED_ENTRY_BYTES")
                .unwrap_or(defaults.capped_entry_bytes),
            cull_frequency: parse_var("CACHE_CULL_FREQUENCY").unwrap_or(defaults.cull_frequency),
            key_prefix: env::var("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            key_version: parse_var("CACHE_KEY_VERSION").unwrap_or(defaults.key_version),
            key_scheme: parse_var("CACHE_KEY_SCHEME").unwrap_or(defaults.key_scheme),
            retry_attempts: parse_var("CACHE_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_backoff_ms: parse_var("CACHE_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.retry_backoff_ms),
            connect_timeout_ms: parse_var("CACHE_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            cull_interval: parse_var("CACHE_CULL_INTERVAL").unwrap_or(defaults.cull_interval),
        }
    }

    // == Policy ==
    /// Validates the ttl/max_entries pair into an [`EvictionPolicy`].
    ///
    /// # Errors
    /// `Configuration` when both or neither are set, or when the set one is 0.
    pub fn policy(&self) -> Result<EvictionPolicy> {
        match (self.ttl, self.max_entries) {
            (Some(_), Some(_)) => Err(CacheError::Configuration(
                "ttl and max_entries are mutually exclusive; set only one".to_string(),
            )),
            (None, None) => Err(CacheError::Configuration(
                "one of ttl or max_entries must be set".to_string(),
            )),
            (Some(0), None) => Err(CacheError::Configuration(
                "ttl must be greater than zero".to_string(),
            )),
            (None, Some(0)) => Err(CacheError::Configuration(
                "max_entries must be greater than zero".to_string(),
            )),
            (Some(ttl), None) => Ok(EvictionPolicy::Expiry {
                ttl: Duration::from_secs(ttl),
            }),
            (None, Some(max_entries)) => Ok(EvictionPolicy::Capacity { max_entries }),
        }
    }

    /// Retry backoff derived from `retry_backoff_ms`.
    pub fn backoff(&self) -> Backoff {
        match self.retry_backoff_ms {
            0 => Backoff::Immediate,
            ms => Backoff::Fixed(Duration::from_millis(ms)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            database: "cache".to_string(),
            collection: "cache_entries".to_string(),
            username: None,
            password: None,
            auth_source: None,
            ttl: Some(300),
            max_entries: None,
            capped_entry_bytes: DEFAULT_CAPPED_ENTRY_BYTES,
            cull_frequency: 3,
            key_prefix: String::new(),
            key_version: 1,
            key_scheme: KeyScheme::Substitute,
            retry_attempts: 3,
            retry_backoff_ms: 0,
            connect_timeout_ms: 5000,
            cull_interval: 60,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
