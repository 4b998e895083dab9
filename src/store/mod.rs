//! Document Store Module
//!
//! The capabilities the cache engine needs from a document store, the
//! connector that provisions the cache collection, the retry wrapper, and two
//! backends: MongoDB and an in-process store.

mod connector;
mod filter;
mod memory;
mod mongo;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::CacheEntry;
use crate::config::CacheConfig;

pub use connector::{CollectionHandle, Connector};
pub use filter::{EntryFilter, KeyMatch, Liveness};
pub use memory::MemoryStore;
pub use mongo::{MongoConnect, MongoStore};
pub use retry::{Backoff, Retry};

/// Field names shared by every backend.
pub mod fields {
    pub const KEY: &str = "key";
    pub const DATA: &str = "data";
    pub const EXPIRES: &str = "expires";
    pub const LAST_CHANGE: &str = "last_change";
}

// == Store Error ==
/// Failure reported by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity blip worth retrying (reset socket, failover, pool cleared)
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// The store refused the operation (duplicate key, bad command, ...)
    #[error("Store rejected operation: {0}")]
    Operation(String),

    /// The collection does not support the operation, e.g. deleting from a
    /// capped collection
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A stored document does not have the expected shape
    #[error("Malformed document: {0}")]
    Decode(String),
}

impl StoreError {
    /// Only reconnect-class failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// == Collection Layout ==
/// How a collection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLayout {
    /// Fixed-size, insertion-ordered; the store evicts the oldest documents
    Capped { max_documents: u64, max_bytes: u64 },
    Unbounded,
}

// == Index Spec ==
/// An index to create on the cache collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    /// Ascending index fields, in order
    pub fields: Vec<&'static str>,
    pub unique: bool,
    /// Set for TTL indexes: documents are removed this long after the
    /// indexed timestamp
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    /// Unique index on `key`, backing upsert-by-key.
    pub fn unique_key() -> Self {
        Self {
            name: "key_unique".to_string(),
            fields: vec![fields::KEY],
            unique: true,
            expire_after: None,
        }
    }

    /// Non-unique index on `key`. Capped collections hold an expired copy of
    /// a key next to its replacement, so their key index cannot be unique.
    pub fn key() -> Self {
        Self {
            name: "key".to_string(),
            fields: vec![fields::KEY],
            unique: false,
            expire_after: None,
        }
    }

    /// TTL index on `expires` with zero grace.
    pub fn expiry() -> Self {
        Self {
            name: "expires_ttl".to_string(),
            fields: vec![fields::EXPIRES],
            unique: false,
            expire_after: Some(Duration::ZERO),
        }
    }

    /// Compound (`key`, `expires`) index for point reads with the liveness
    /// filter.
    pub fn lookup() -> Self {
        Self {
            name: "key_expires".to_string(),
            fields: vec![fields::KEY, fields::EXPIRES],
            unique: false,
            expire_after: None,
        }
    }
}

// == Capability Traits ==

/// Opens a [`DocumentStore`] from configuration.
#[async_trait]
pub trait StoreConnect: Send + Sync + 'static {
    async fn connect(&self, config: &CacheConfig) -> StoreResult<Arc<dyn DocumentStore>>;
}

/// Database-level operations: reachability and collection provisioning.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn ping(&self) -> StoreResult<()>;

    async fn collection_exists(&self, name: &str) -> StoreResult<bool>;

    async fn create_collection(&self, name: &str, layout: CollectionLayout) -> StoreResult<()>;

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()>;

    /// Whether the store reports the collection as capped.
    async fn is_capped(&self, name: &str) -> StoreResult<bool>;

    fn collection(&self, name: &str) -> Arc<dyn EntryCollection>;
}

/// Operations on the cache collection itself.
#[async_trait]
pub trait EntryCollection: Send + Sync + 'static {
    /// The matching document with the newest `last_change`.
    async fn find_one(&self, filter: &EntryFilter) -> StoreResult<Option<CacheEntry>>;

    async fn find(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>>;

    /// Atomic insert-or-replace keyed by `entry.key`.
    async fn upsert(&self, entry: &CacheEntry) -> StoreResult<()>;

    /// Appends a new document, even if one with the same key exists. Capped
    /// collections evict their oldest documents to make room.
    async fn insert(&self, entry: &CacheEntry) -> StoreResult<()>;

    /// Physically removes matching documents. Capped collections refuse.
    async fn remove(&self, filter: &EntryFilter) -> StoreResult<u64>;

    /// Soft removal: sets `expires` on matching documents to `at`.
    async fn expire(&self, filter: &EntryFilter, at: DateTime<Utc>) -> StoreResult<u64>;

    /// Removes up to `limit` documents with the oldest `last_change`.
    async fn remove_oldest(&self, limit: u64) -> StoreResult<u64>;

    async fn count(&self) -> StoreResult<u64>;
}
