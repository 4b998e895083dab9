//! In-process document store.
//!
//! Models the parts of MongoDB the cache relies on: upsert by key, capped
//! collections with insertion-order eviction, no physical deletes and no
//! resizing updates, unique key indexes, and TTL indexes (swept on demand
//! with [`MemoryStore::sweep_expired`]). Also
//! supports fault injection so retry and failure paths can be exercised
//! without a server.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::config::CacheConfig;
use crate::store::{
    fields, CollectionLayout, DocumentStore, EntryCollection, EntryFilter, IndexSpec, StoreConnect,
    StoreError, StoreResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// == Memory Store ==
/// Cheaply cloneable handle; clones share the same collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
    faults: Arc<Faults>,
    unreachable: AtomicBool,
    connects: AtomicUsize,
    creates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` and `ping` fail until set back to true.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fails the next collection operation with `err`.
    pub fn fail_next(&self, err: StoreError) {
        self.fail_next_n(1, err);
    }

    /// Fails the next `n` collection operations with `err`.
    pub fn fail_next_n(&self, n: usize, err: StoreError) {
        let mut queue = lock(&self.inner.faults.queue);
        queue.extend(std::iter::repeat(err).take(n));
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of `create_collection` calls that created a collection.
    pub fn create_count(&self) -> usize {
        self.inner.creates.load(Ordering::SeqCst)
    }

    /// Layout the collection was created with, None if it does not exist.
    pub fn layout(&self, collection: &str) -> Option<CollectionLayout> {
        self.existing(collection).map(|c| c.layout)
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.existing(collection)
            .map(|c| lock(&c.indexes).clone())
            .unwrap_or_default()
    }

    /// Physical document count, expired documents included.
    pub async fn len(&self, collection: &str) -> usize {
        match self.existing(collection) {
            Some(c) => c.state.read().await.documents.len(),
            None => 0,
        }
    }

    // == Sweep Expired ==
    /// Runs one pass of the TTL monitor: removes expired documents from
    /// collections that carry a TTL index. Returns the number removed.
    pub async fn sweep_expired(&self, collection: &str, now: DateTime<Utc>) -> usize {
        let Some(coll) = self.existing(collection) else {
            return 0;
        };
        if !coll.has_ttl_index() {
            return 0;
        }

        let mut state = coll.state.write().await;
        let before = state.documents.len();
        state.documents.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - state.documents.len();

        debug!(collection, removed, "TTL sweep");
        removed
    }

    fn existing(&self, name: &str) -> Option<Arc<MemoryCollection>> {
        lock(&self.inner.collections).get(name).cloned()
    }
}

#[async_trait]
impl StoreConnect for MemoryStore {
    async fn connect(&self, _config: &CacheConfig) -> StoreResult<Arc<dyn DocumentStore>> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("connection refused".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.existing(name).is_some())
    }

    async fn create_collection(&self, name: &str, layout: CollectionLayout) -> StoreResult<()> {
        let mut collections = lock(&self.inner.collections);
        if collections.contains_key(name) {
            return Err(StoreError::Operation(format!(
                "collection already exists: {}",
                name
            )));
        }

        collections.insert(
            name.to_string(),
            Arc::new(MemoryCollection::new(layout, self.inner.faults.clone())),
        );
        self.inner.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        let coll = self.collection_state(collection);
        if coll.capped.is_some() && index.expire_after.is_some() {
            return Err(StoreError::Unsupported(
                "TTL indexes cannot be created on capped collections".to_string(),
            ));
        }

        let mut indexes = lock(&coll.indexes);
        if !indexes.iter().any(|existing| existing.name == index.name) {
            indexes.push(index.clone());
        }
        Ok(())
    }

    async fn is_capped(&self, name: &str) -> StoreResult<bool> {
        Ok(self
            .existing(name)
            .map(|c| c.capped.is_some())
            .unwrap_or(false))
    }

    fn collection(&self, name: &str) -> Arc<dyn EntryCollection> {
        self.collection_state(name)
    }
}

impl MemoryStore {
    /// Looks up a collection, creating an unbounded one on first use the way
    /// MongoDB does on first write.
    fn collection_state(&self, name: &str) -> Arc<MemoryCollection> {
        lock(&self.inner.collections)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryCollection::new(
                    CollectionLayout::Unbounded,
                    self.inner.faults.clone(),
                ))
            })
            .clone()
    }
}

// == Faults ==
#[derive(Default)]
struct Faults {
    queue: Mutex<VecDeque<StoreError>>,
}

impl Faults {
    fn check(&self) -> StoreResult<()> {
        match lock(&self.queue).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// == Memory Collection ==
struct MemoryCollection {
    layout: CollectionLayout,
    /// Document bound for capped collections
    capped: Option<u64>,
    state: RwLock<CollectionState>,
    indexes: Mutex<Vec<IndexSpec>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct CollectionState {
    /// Documents by insertion sequence, oldest first
    documents: BTreeMap<u64, CacheEntry>,
    next_id: u64,
}

impl CollectionState {
    /// Sequence number of the newest document stored under `key`.
    fn newest(&self, key: &str) -> Option<u64> {
        self.documents
            .iter()
            .filter(|(_, entry)| entry.key == key)
            .max_by_key(|(id, entry)| (entry.last_change, **id))
            .map(|(id, _)| *id)
    }

    /// Appends `entry`, evicting the oldest documents beyond `capped`.
    fn append(&mut self, entry: CacheEntry, capped: Option<u64>) {
        if let Some(max) = capped {
            while self.documents.len() as u64 >= max {
                if self.documents.pop_first().is_none() {
                    break;
                }
            }
        }
        self.documents.insert(self.next_id, entry);
        self.next_id += 1;
    }
}

impl MemoryCollection {
    fn new(layout: CollectionLayout, faults: Arc<Faults>) -> Self {
        let capped = match layout {
            CollectionLayout::Capped { max_documents, .. } => Some(max_documents),
            CollectionLayout::Unbounded => None,
        };
        Self {
            layout,
            capped,
            state: RwLock::new(CollectionState::default()),
            indexes: Mutex::new(Vec::new()),
            faults,
        }
    }

    fn has_ttl_index(&self) -> bool {
        lock(&self.indexes).iter().any(|i| i.expire_after.is_some())
    }

    fn has_unique_key_index(&self) -> bool {
        lock(&self.indexes)
            .iter()
            .any(|i| i.unique && i.fields == [fields::KEY])
    }

    fn refuse_if_capped(&self, operation: &str) -> StoreResult<()> {
        if self.capped.is_some() {
            return Err(StoreError::Unsupported(format!(
                "cannot {} documents in a capped collection",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EntryCollection for MemoryCollection {
    async fn find_one(&self, filter: &EntryFilter) -> StoreResult<Option<CacheEntry>> {
        self.faults.check()?;
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .filter(|(_, entry)| filter.matches(entry))
            .max_by_key(|(id, entry)| (entry.last_change, **id))
            .map(|(_, entry)| entry.clone()))
    }

    async fn find(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>> {
        self.faults.check()?;
        let state = self.state.read().await;
        Ok(state
            .documents
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn upsert(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.faults.check()?;
        let mut state = self.state.write().await;

        let Some(id) = state.newest(&entry.key) else {
            state.append(entry.clone(), self.capped);
            return Ok(());
        };
        if let Some(stored) = state.documents.get_mut(&id) {
            if self.capped.is_some() && stored.data.len() != entry.data.len() {
                return Err(StoreError::Operation(
                    "cannot change the size of a document in a capped collection".to_string(),
                ));
            }
            *stored = entry.clone();
        }
        Ok(())
    }

    async fn insert(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.faults.check()?;
        let mut state = self.state.write().await;

        if self.has_unique_key_index() && state.newest(&entry.key).is_some() {
            return Err(StoreError::Operation(format!(
                "E11000 duplicate key error: {}",
                entry.key
            )));
        }
        state.append(entry.clone(), self.capped);
        Ok(())
    }

    async fn remove(&self, filter: &EntryFilter) -> StoreResult<u64> {
        self.faults.check()?;
        self.refuse_if_capped("remove")?;

        let mut state = self.state.write().await;
        let before = state.documents.len();
        state.documents.retain(|_, e| !filter.matches(e));
        Ok((before - state.documents.len()) as u64)
    }

    async fn expire(&self, filter: &EntryFilter, at: DateTime<Utc>) -> StoreResult<u64> {
        self.faults.check()?;
        let mut state = self.state.write().await;

        let mut updated = 0;
        for entry in state.documents.values_mut().filter(|e| filter.matches(e)) {
            entry.expires = Some(at);
            updated += 1;
        }
        Ok(updated)
    }

    async fn remove_oldest(&self, limit: u64) -> StoreResult<u64> {
        self.faults.check()?;
        self.refuse_if_capped("remove")?;

        let mut state = self.state.write().await;
        let mut by_age: Vec<(DateTime<Utc>, u64)> = state
            .documents
            .iter()
            .map(|(id, e)| (e.last_change, *id))
            .collect();
        by_age.sort();

        let victims: Vec<u64> = by_age
            .into_iter()
            .take(limit as usize)
            .map(|(_, id)| id)
            .collect();
        for id in &victims {
            state.documents.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn count(&self) -> StoreResult<u64> {
        self.faults.check()?;
        Ok(self.state.read().await.documents.len() as u64)
    }
}
