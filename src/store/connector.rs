//! Store Connector Module
//!
//! Lazily opens the cache collection once per cache instance, creates it
//! according to the eviction policy when missing, and ensures its indexes on
//! every initialization.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, EvictionPolicy};
use crate::error::{CacheError, Result};
use crate::store::{
    CollectionLayout, DocumentStore, EntryCollection, IndexSpec, StoreConnect, StoreError,
};

/// Smallest capped collection size MongoDB accepts without rounding.
pub const MIN_CAPPED_BYTES: u64 = 4096;

// == Collection Handle ==
/// The provisioned cache collection and its reported mode.
#[derive(Clone)]
pub struct CollectionHandle {
    name: String,
    collection: Arc<dyn EntryCollection>,
    capped: bool,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &Arc<dyn EntryCollection> {
        &self.collection
    }

    /// Whether the store reported the collection as capped. Capped
    /// collections refuse physical deletes.
    pub fn is_capped(&self) -> bool {
        self.capped
    }
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("name", &self.name)
            .field("capped", &self.capped)
            .finish()
    }
}

// == Connector ==
/// Memoizes the collection handle behind a single-initialization cell.
///
/// Concurrent first callers wait on the same initialization. A failed
/// initialization leaves the cell empty, so the next call tries again.
pub struct Connector {
    config: CacheConfig,
    policy: EvictionPolicy,
    connect: Arc<dyn StoreConnect>,
    handle: OnceCell<CollectionHandle>,
}

impl Connector {
    pub fn new(config: CacheConfig, policy: EvictionPolicy, connect: Arc<dyn StoreConnect>) -> Self {
        Self {
            config,
            policy,
            connect,
            handle: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.initialized()
    }

    // == Get Collection ==
    /// Returns the collection handle, connecting and provisioning on first
    /// use.
    ///
    /// # Errors
    /// - `Connection` if the store cannot be reached
    /// - `Configuration` if provisioning the collection fails
    pub async fn get_collection(&self) -> Result<&CollectionHandle> {
        self.handle.get_or_try_init(|| self.initialize()).await
    }

    async fn initialize(&self) -> Result<CollectionHandle> {
        let config = &self.config;
        let name = config.collection.as_str();

        debug!(host = %config.host, port = config.port, database = %config.database, "Connecting to store");
        let store = self
            .connect
            .connect(config)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        store
            .ping()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let exists = store
            .collection_exists(name)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        if exists {
            debug!(collection = name, "Using existing collection");
        } else {
            self.create(store.as_ref(), name).await?;
        }

        let capped = store
            .is_capped(name)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        if capped != self.policy.is_capacity() {
            warn!(
                collection = name,
                capped,
                policy = ?self.policy,
                "Existing collection mode does not match the eviction policy"
            );
        }

        // A run that created the collection may have died before its
        // indexes, so they are ensured every time. Index creation is
        // idempotent.
        self.ensure_indexes(store.as_ref(), name, capped).await?;

        Ok(CollectionHandle {
            name: name.to_string(),
            collection: store.collection(name),
            capped,
        })
    }

    // == Create ==
    async fn create(&self, store: &dyn DocumentStore, name: &str) -> Result<()> {
        let layout = match self.policy {
            EvictionPolicy::Capacity { max_entries } => CollectionLayout::Capped {
                max_documents: max_entries,
                max_bytes: max_entries
                    .saturating_mul(self.config.capped_entry_bytes)
                    .max(MIN_CAPPED_BYTES),
            },
            EvictionPolicy::Expiry { .. } => CollectionLayout::Unbounded,
        };

        if let Err(err) = store.create_collection(name, layout).await {
            // Another process may have created it between our check and now
            if store.collection_exists(name).await.unwrap_or(false) {
                debug!(collection = name, "Collection created concurrently");
                return Ok(());
            }
            return Err(provisioning_error(name, err));
        }

        info!(collection = name, ?layout, "Created cache collection");
        Ok(())
    }

    // == Ensure Indexes ==
    /// Indexes follow the reported mode: capped collections keep replaced
    /// copies of a key and refuse TTL indexes, so they only get a plain key
    /// index.
    async fn ensure_indexes(&self, store: &dyn DocumentStore, name: &str, capped: bool) -> Result<()> {
        let indexes = match (capped, self.policy) {
            (true, _) => vec![IndexSpec::key()],
            (false, EvictionPolicy::Capacity { .. }) => vec![IndexSpec::unique_key()],
            (false, EvictionPolicy::Expiry { .. }) => vec![
                IndexSpec::unique_key(),
                IndexSpec::expiry(),
                IndexSpec::lookup(),
            ],
        };
        for index in &indexes {
            store
                .create_index(name, index)
                .await
                .map_err(|e| provisioning_error(name, e))?;
        }

        debug!(collection = name, indexes = indexes.len(), "Indexes ensured");
        Ok(())
    }
}

fn provisioning_error(name: &str, err: StoreError) -> CacheError {
    CacheError::Configuration(format!("failed to provision collection '{}': {}", name, err))
}
