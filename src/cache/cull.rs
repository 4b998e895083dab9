//! Culling Strategy Module
//!
//! Sheds entries under the capacity policy when the store does not bound the
//! collection itself, and picks how entries are removed from a collection.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::EvictionPolicy;
use crate::error::Result;
use crate::store::{CollectionHandle, EntryCollection, EntryFilter, Retry, StoreResult};

// == Removal Strategy ==
/// How `delete` and `clear` take entries out of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalStrategy {
    /// Delete the documents
    Physical,
    /// Set `expires` to now; used where deletes are refused (capped
    /// collections). Reads treat the entry as gone from then on.
    SoftExpire,
}

impl RemovalStrategy {
    /// Chosen from the collection's reported mode, not from the policy.
    pub fn for_handle(handle: &CollectionHandle) -> Self {
        if handle.is_capped() {
            RemovalStrategy::SoftExpire
        } else {
            RemovalStrategy::Physical
        }
    }

    /// Removes entries matching `filter`, returning how many were affected.
    pub async fn remove(
        &self,
        collection: &dyn EntryCollection,
        filter: &EntryFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        match self {
            RemovalStrategy::Physical => collection.remove(filter).await,
            // Already-expired entries are left alone so their expiry is kept
            RemovalStrategy::SoftExpire => {
                collection
                    .expire(&filter.clone().live_at(now), now)
                    .await
            }
        }
    }
}

// == Cull Strategy ==
/// Capacity-mode shedding.
///
/// With `cull_frequency == 0` the whole collection is cleared. Otherwise
/// expired entries go first, then, if still over the bound, the larger of
/// `count / cull_frequency` and the overflow is removed oldest `last_change`
/// first.
#[derive(Debug, Clone, Copy)]
pub struct CullStrategy {
    policy: EvictionPolicy,
    cull_frequency: u32,
}

impl CullStrategy {
    pub fn new(policy: EvictionPolicy, cull_frequency: u32) -> Self {
        Self {
            policy,
            cull_frequency,
        }
    }

    /// The document bound to enforce for this handle, if any.
    ///
    /// Under the expiry policy the TTL index does the work. Capped
    /// collections are bounded by the store and refuse deletes.
    pub fn bound(&self, handle: &CollectionHandle) -> Option<u64> {
        match self.policy {
            EvictionPolicy::Capacity { max_entries } if !handle.is_capped() => Some(max_entries),
            _ => None,
        }
    }

    // == Run ==
    /// Culls if the collection cannot take `incoming` more documents without
    /// exceeding the bound. Returns the number of entries removed.
    ///
    /// # Arguments
    /// * `handle` - Collection to cull
    /// * `retry` - Retry wrapper for each store call
    /// * `now` - Current time, for the expired-entries pass
    /// * `incoming` - Documents about to be written (1 before a write, 0 for
    ///   a periodic sweep)
    pub async fn run(
        &self,
        handle: &CollectionHandle,
        retry: &Retry,
        now: DateTime<Utc>,
        incoming: u64,
    ) -> Result<u64> {
        let Some(max_entries) = self.bound(handle) else {
            return Ok(0);
        };

        let collection = handle.collection();
        let count = retry.run("count", || collection.count()).await?;
        if count + incoming <= max_entries {
            return Ok(0);
        }

        if self.cull_frequency == 0 {
            let all = EntryFilter::all();
            let removed = retry.run("cull", || collection.remove(&all)).await?;
            info!(collection = handle.name(), removed, "Over capacity, cleared collection");
            return Ok(removed);
        }

        let expired_filter = EntryFilter::all().expired_at(now);
        let expired = retry
            .run("cull", || collection.remove(&expired_filter))
            .await?;

        let remaining = count.saturating_sub(expired);
        let mut oldest = 0;
        if remaining + incoming > max_entries {
            let overflow = remaining + incoming - max_entries;
            let target = (remaining / u64::from(self.cull_frequency)).max(overflow);
            oldest = retry
                .run("cull", || collection.remove_oldest(target))
                .await?;
        }

        debug!(count, expired, oldest, "Cull pass finished");
        info!(
            collection = handle.name(),
            removed = expired + oldest,
            "Over capacity, culled entries"
        );
        Ok(expired + oldest)
    }
}
