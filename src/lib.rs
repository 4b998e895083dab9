//! Mongo Cache - A key-value cache stored in a MongoDB collection
//!
//! Entries expire through a TTL index or are bounded by a capped collection,
//! depending on the configured eviction policy.

pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod tasks;

pub use cache::{DocumentCache, Timeout, VersionedCache};
pub use config::{CacheConfig, EvictionPolicy};
pub use error::{CacheError, Result};
pub use store::{MemoryStore, MongoConnect};
pub use tasks::spawn_cull_task;
