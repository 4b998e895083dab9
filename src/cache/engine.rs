//! Cache Engine Module
//!
//! The public cache API: add, set, get, get_many, delete, has_key and clear
//! over a lazily provisioned document collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{
    CacheEntry, CacheStats, Clock, CullStrategy, KeyNormalizer, RemovalStrategy, StatsRecorder,
    SystemClock, Timeout,
};
use crate::config::{CacheConfig, EvictionPolicy};
use crate::error::Result;
use crate::store::{CollectionHandle, Connector, EntryFilter, Retry, StoreConnect};

// == Document Cache ==
/// A key-value cache stored in a single document collection.
///
/// Cheap to share behind an `Arc`; all operations take `&self`. The
/// collection is opened on first use (or eagerly with [`connect`]).
///
/// Reads propagate store failures. Writes (`add`/`set`) report store
/// failures as `Ok(false)` so a cache outage never fails the caller.
///
/// [`connect`]: DocumentCache::connect
pub struct DocumentCache {
    connector: Connector,
    normalizer: KeyNormalizer,
    policy: EvictionPolicy,
    retry: Retry,
    culling: CullStrategy,
    clock: Arc<dyn Clock>,
    stats: StatsRecorder,
}

impl DocumentCache {
    // == Constructor ==
    /// Creates a cache over the store opened by `connect`.
    ///
    /// Nothing is contacted until the first operation.
    ///
    /// # Errors
    /// `Configuration` if the eviction policy is missing or ambiguous.
    pub fn new(config: CacheConfig, connect: Arc<dyn StoreConnect>) -> Result<Self> {
        Self::with_clock(config, connect, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) but reads time from `clock`.
    pub fn with_clock(
        config: CacheConfig,
        connect: Arc<dyn StoreConnect>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policy = config.policy()?;
        let normalizer =
            KeyNormalizer::new(config.key_prefix.clone(), config.key_version, config.key_scheme);
        let retry = Retry::new(config.retry_attempts, config.backoff());
        let culling = CullStrategy::new(policy, config.cull_frequency);

        Ok(Self {
            connector: Connector::new(config, policy, connect),
            normalizer,
            policy,
            retry,
            culling,
            clock,
            stats: StatsRecorder::new(),
        })
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Returns a snapshot of the hit/miss/write counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Opens and provisions the collection now instead of on first use.
    ///
    /// # Errors
    /// - `Connection` if the store cannot be reached
    /// - `Configuration` if provisioning fails
    pub async fn connect(&self) -> Result<()> {
        self.connector.get_collection().await.map(|_| ())
    }

    /// A view whose operations use key `version` instead of the configured
    /// default. Entries written under one version are invisible to others.
    pub fn version(&self, version: i64) -> VersionedCache<'_> {
        VersionedCache {
            cache: self,
            version,
        }
    }

    // == Add ==
    /// Stores `value` under `key` only if no live entry exists.
    ///
    /// Returns false if a live entry was already present or the store
    /// failed. Two concurrent adds for the same key may both return true;
    /// the later write wins.
    ///
    /// # Errors
    /// `InvalidKey` if the key cannot be normalized.
    pub async fn add(&self, key: &str, value: &[u8], timeout: Timeout) -> Result<bool> {
        self.add_versioned(key, None, value, timeout).await
    }

    async fn add_versioned(
        &self,
        key: &str,
        version: Option<i64>,
        value: &[u8],
        timeout: Timeout,
    ) -> Result<bool> {
        let storage_key = self.normalizer.normalize(key, version)?;
        let outcome = self.write("add", &storage_key, value, timeout, true).await;
        self.settle_write("add", key, outcome)
    }

    // == Set ==
    /// Stores `value` under `key`, replacing any existing entry.
    ///
    /// Returns false if the store failed.
    ///
    /// # Arguments
    /// * `key` - Application key
    /// * `value` - Payload, stored verbatim
    /// * `timeout` - Expiry for this entry; ignored under the capacity policy
    ///
    /// # Errors
    /// `InvalidKey` if the key cannot be normalized.
    pub async fn set(&self, key: &str, value: &[u8], timeout: Timeout) -> Result<bool> {
        self.set_versioned(key, None, value, timeout).await
    }

    async fn set_versioned(
        &self,
        key: &str,
        version: Option<i64>,
        value: &[u8],
        timeout: Timeout,
    ) -> Result<bool> {
        let storage_key = self.normalizer.normalize(key, version)?;
        let outcome = self.write("set", &storage_key, value, timeout, false).await;
        self.settle_write("set", key, outcome)
    }

    async fn write(
        &self,
        operation: &str,
        storage_key: &str,
        value: &[u8],
        timeout: Timeout,
        only_if_absent: bool,
    ) -> Result<bool> {
        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let now = self.clock.now();

        // The live copy decides whether add proceeds and whether this write
        // grows a collection that is culled by count
        let live = if only_if_absent || self.culling.bound(handle).is_some() {
            let filter = EntryFilter::key(storage_key).live_at(now);
            self.retry
                .run(operation, || collection.find_one(&filter))
                .await?
        } else {
            None
        };
        if only_if_absent && live.is_some() {
            debug!(key = storage_key, "Live entry present, add skipped");
            return Ok(false);
        }

        let incoming = if live.is_some() { 0 } else { 1 };
        self.cull_before_write(handle, now, incoming).await?;

        let entry = CacheEntry::new(
            storage_key,
            value.to_vec(),
            self.expires_for(timeout, now),
            now,
        );
        if handle.is_capped() {
            // Capped documents cannot change size, so the live copy is
            // expired and the new value appended
            let filter = EntryFilter::key(storage_key).live_at(now);
            self.retry
                .run(operation, || collection.expire(&filter, now))
                .await?;
            self.retry
                .run(operation, || collection.insert(&entry))
                .await?;
        } else {
            self.retry
                .run(operation, || collection.upsert(&entry))
                .await?;
        }

        debug!(operation, key = storage_key, expires = ?entry.expires, "Stored entry");
        Ok(true)
    }

    /// Store failures become `false`; anything else reaches the caller.
    fn settle_write(&self, operation: &str, key: &str, outcome: Result<bool>) -> Result<bool> {
        match outcome {
            Ok(written) => {
                if written {
                    self.stats.record_write();
                }
                Ok(written)
            }
            Err(err) if err.is_store_failure() => {
                warn!(operation, key, error = %err, "Cache write failed");
                self.stats.record_failed_write();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn expires_for(&self, timeout: Timeout, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = match (self.policy, timeout) {
            (EvictionPolicy::Capacity { .. }, _) | (_, Timeout::Never) => return None,
            (EvictionPolicy::Expiry { ttl }, Timeout::Default) => ttl,
            (EvictionPolicy::Expiry { .. }, Timeout::After(ttl)) => ttl,
        };
        expires_after(now, ttl)
    }

    async fn cull_before_write(
        &self,
        handle: &CollectionHandle,
        now: DateTime<Utc>,
        incoming: u64,
    ) -> Result<()> {
        let culled = self.culling.run(handle, &self.retry, now, incoming).await?;
        if culled > 0 {
            self.stats.record_culled(culled);
        }
        Ok(())
    }

    // == Get ==
    /// Returns the live value stored under `key`, if any.
    ///
    /// # Errors
    /// `InvalidKey`, or any store failure.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_versioned(key, None).await
    }

    async fn get_versioned(&self, key: &str, version: Option<i64>) -> Result<Option<Vec<u8>>> {
        let storage_key = self.normalizer.normalize(key, version)?;
        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let filter = EntryFilter::key(storage_key).live_at(self.clock.now());

        let found = self.retry.run("get", || collection.find_one(&filter)).await?;
        match found {
            Some(entry) => {
                self.stats.record_hits(1);
                debug!(key, "Cache hit");
                Ok(Some(entry.data))
            }
            None => {
                self.stats.record_misses(1);
                debug!(key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Returns the value under `key`, or `default` on a miss.
    pub async fn get_or(&self, key: &str, default: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    // == Get Many ==
    /// Fetches several keys in one lookup.
    ///
    /// The result is keyed by the caller's keys; missing and expired keys
    /// are left out.
    ///
    /// # Errors
    /// `InvalidKey` if any key cannot be normalized, or any store failure.
    pub async fn get_many<I, K>(&self, keys: I) -> Result<HashMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.get_many_versioned(keys, None).await
    }

    async fn get_many_versioned<I, K>(
        &self,
        keys: I,
        version: Option<i64>,
    ) -> Result<HashMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        // Several raw keys can share a storage key under lossy normalization
        let mut requested: HashMap<String, Vec<String>> = HashMap::new();
        let mut total = 0u64;
        for key in keys {
            let key = key.as_ref();
            let storage_key = self.normalizer.normalize(key, version)?;
            requested
                .entry(storage_key)
                .or_default()
                .push(key.to_string());
            total += 1;
        }
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let filter =
            EntryFilter::keys(requested.keys().cloned().collect()).live_at(self.clock.now());
        let entries = self.retry.run("get_many", || collection.find(&filter)).await?;

        // A capped collection may briefly hold two live copies of a key
        let mut newest: HashMap<String, CacheEntry> = HashMap::with_capacity(entries.len());
        for entry in entries {
            let replace = newest
                .get(&entry.key)
                .map_or(true, |seen| seen.last_change < entry.last_change);
            if replace {
                newest.insert(entry.key.clone(), entry);
            }
        }

        let mut found = HashMap::with_capacity(newest.len());
        for (storage_key, entry) in newest {
            if let Some(raw_keys) = requested.remove(&storage_key) {
                for raw_key in raw_keys {
                    found.insert(raw_key, entry.data.clone());
                }
            }
        }

        let hits = found.len() as u64;
        self.stats.record_hits(hits);
        self.stats.record_misses(total.saturating_sub(hits));
        debug!(requested = total, hits, "Batch lookup");
        Ok(found)
    }

    // == Delete ==
    /// Removes the entry under `key`. Returns true if a live entry was
    /// removed.
    ///
    /// On capped collections the entry is expired in place instead.
    ///
    /// # Errors
    /// `InvalidKey`, or any store failure.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_versioned(key, None).await
    }

    async fn delete_versioned(&self, key: &str, version: Option<i64>) -> Result<bool> {
        let storage_key = self.normalizer.normalize(key, version)?;
        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let strategy = RemovalStrategy::for_handle(handle);
        let now = self.clock.now();
        let filter = EntryFilter::key(storage_key).live_at(now);

        let removed = self
            .retry
            .run("delete", || strategy.remove(collection.as_ref(), &filter, now))
            .await?;

        debug!(key, removed, ?strategy, "Deleted entry");
        Ok(removed > 0)
    }

    // == Has Key ==
    /// Returns true if a live entry exists under `key`.
    pub async fn has_key(&self, key: &str) -> Result<bool> {
        self.has_key_versioned(key, None).await
    }

    async fn has_key_versioned(&self, key: &str, version: Option<i64>) -> Result<bool> {
        let storage_key = self.normalizer.normalize(key, version)?;
        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let filter = EntryFilter::key(storage_key).live_at(self.clock.now());

        let found = self.retry.run("has_key", || collection.find_one(&filter)).await?;
        Ok(found.is_some())
    }

    // == Clear ==
    /// Removes every entry. Returns the number of entries affected.
    ///
    /// On capped collections every live entry is expired in place.
    pub async fn clear(&self) -> Result<u64> {
        let handle = self.connector.get_collection().await?;
        let collection = handle.collection();
        let strategy = RemovalStrategy::for_handle(handle);
        let now = self.clock.now();
        let filter = EntryFilter::all();

        let removed = self
            .retry
            .run("clear", || strategy.remove(collection.as_ref(), &filter, now))
            .await?;

        debug!(collection = handle.name(), removed, ?strategy, "Cleared cache");
        Ok(removed)
    }

    // == Cull ==
    /// Runs the culling strategy now. Returns the number of entries removed.
    ///
    /// A no-op under the expiry policy and on capped collections.
    pub async fn cull(&self) -> Result<u64> {
        let handle = self.connector.get_collection().await?;
        let culled = self
            .culling
            .run(handle, &self.retry, self.clock.now(), 0)
            .await?;
        if culled > 0 {
            self.stats.record_culled(culled);
        }
        Ok(culled)
    }

    // == JSON Values ==
    /// Serializes `value` as JSON and stores it with [`set`](Self::set).
    ///
    /// # Errors
    /// `Serialization` if the value cannot be encoded, `InvalidKey`.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, timeout: Timeout) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, timeout).await
    }

    /// Reads a JSON value stored with [`set_json`](Self::set_json).
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCache")
            .field("policy", &self.policy)
            .field("normalizer", &self.normalizer)
            .field("retry", &self.retry)
            .field("connected", &self.connector.is_initialized())
            .finish()
    }
}

// == Versioned View ==
/// Cache operations under an explicit key version.
///
/// Obtained from [`DocumentCache::version`].
#[derive(Debug, Clone, Copy)]
pub struct VersionedCache<'a> {
    cache: &'a DocumentCache,
    version: i64,
}

impl VersionedCache<'_> {
    /// [`DocumentCache::add`] under this version.
    pub async fn add(&self, key: &str, value: &[u8], timeout: Timeout) -> Result<bool> {
        self.cache
            .add_versioned(key, Some(self.version), value, timeout)
            .await
    }

    /// [`DocumentCache::set`] under this version.
    pub async fn set(&self, key: &str, value: &[u8], timeout: Timeout) -> Result<bool> {
        self.cache
            .set_versioned(key, Some(self.version), value, timeout)
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.cache.get_versioned(key, Some(self.version)).await
    }

    pub async fn get_many<I, K>(&self, keys: I) -> Result<HashMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.cache.get_many_versioned(keys, Some(self.version)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.cache.delete_versioned(key, Some(self.version)).await
    }

    pub async fn has_key(&self, key: &str) -> Result<bool> {
        self.cache.has_key_versioned(key, Some(self.version)).await
    }
}

/// `now + ttl`, or None when the sum leaves the representable range.
fn expires_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::error::CacheError;
    use crate::store::{MemoryStore, StoreError};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn expiry_cache(store: &MemoryStore) -> (DocumentCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let config = CacheConfig {
            ttl: Some(60),
            ..CacheConfig::default()
        };
        let cache = DocumentCache::with_clock(config, Arc::new(store.clone()), clock.clone()).unwrap();
        (cache, clock)
    }

    #[test]
    fn test_new_rejects_ambiguous_policy() {
        let config = CacheConfig {
            ttl: Some(60),
            max_entries: Some(10),
            ..CacheConfig::default()
        };
        let result = DocumentCache::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_construction_is_lazy() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);
        assert_eq!(store.connect_count(), 0);

        cache.connect().await.unwrap();
        cache.connect().await.unwrap();
        assert_eq!(store.connect_count(), 1);
    }

    #[test]
    fn test_expires_for_policy() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);
        let now = start();

        assert_eq!(
            cache.expires_for(Timeout::Default, now),
            Some(now + chrono::Duration::seconds(60))
        );
        assert_eq!(
            cache.expires_for(Timeout::After(Duration::from_secs(5)), now),
            Some(now + chrono::Duration::seconds(5))
        );
        assert_eq!(cache.expires_for(Timeout::Never, now), None);

        let capacity = DocumentCache::new(
            CacheConfig {
                ttl: None,
                max_entries: Some(10),
                ..CacheConfig::default()
            },
            Arc::new(store),
        )
        .unwrap();
        assert_eq!(capacity.expires_for(Timeout::Default, now), None);
        assert_eq!(
            capacity.expires_for(Timeout::After(Duration::from_secs(5)), now),
            None
        );
    }

    #[test]
    fn test_expires_after_overflow_never_expires() {
        assert_eq!(expires_after(start(), Duration::from_secs(u64::MAX)), None);
    }

    #[tokio::test]
    async fn test_set_get_and_stats() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        assert!(cache.set("user", b"alice", Timeout::Default).await.unwrap());
        assert_eq!(cache.get("user").await.unwrap(), Some(b"alice".to_vec()));
        assert_eq!(cache.get("other").await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_never_readable() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        assert!(cache
            .set("k", b"v", Timeout::After(Duration::ZERO))
            .await
            .unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.has_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_returns_false() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);
        cache.connect().await.unwrap();

        store.fail_next(StoreError::Operation("disk full".into()));
        assert!(!cache.set("k", b"v", Timeout::Default).await.unwrap());
        assert_eq!(cache.stats().failed_writes, 1);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);
        cache.connect().await.unwrap();

        store.fail_next(StoreError::Operation("bad query".into()));
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::StoreOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_key_never_reaches_store() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        let long = "x".repeat(300);
        assert!(matches!(
            cache.set(&long, b"v", Timeout::Default).await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.get("").await, Err(CacheError::InvalidKey(_))));
        assert_eq!(store.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_get_many_with_colliding_keys() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        // "a.b" and "a$b" share a storage key under substitution
        cache.set("a.b", b"v", Timeout::Default).await.unwrap();
        let found = cache.get_many(["a.b", "a$b", "missing"]).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["a$b"], b"v".to_vec());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_get_many_empty_does_not_connect() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        let found = cache.get_many(Vec::<String>::new()).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(store.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_json_values() {
        let store = MemoryStore::new();
        let (cache, clock) = expiry_cache(&store);

        let value = serde_json::json!({"name": "alice", "visits": 3});
        assert!(cache.set_json("profile", &value, Timeout::Default).await.unwrap());

        let read: Option<serde_json::Value> = cache.get_json("profile").await.unwrap();
        assert_eq!(read, Some(value));

        clock.advance(Duration::from_secs(61));
        let read: Option<serde_json::Value> = cache.get_json("profile").await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn test_get_json_rejects_non_json_bytes() {
        let store = MemoryStore::new();
        let (cache, _) = expiry_cache(&store);

        cache.set("raw", &[0xff, 0x00], Timeout::Default).await.unwrap();
        let result: Result<Option<serde_json::Value>> = cache.get_json("raw").await;
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }
}
