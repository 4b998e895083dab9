//! Cull Task
//!
//! Background task that periodically runs the culling strategy, so a cache
//! that stops receiving writes still sheds entries over the capacity bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::DocumentCache;

/// Spawns a background task that periodically culls the cache.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between passes. Failed passes are logged and the loop carries on.
///
/// # Arguments
/// * `cache` - Shared cache instance
/// * `cull_interval_secs` - Interval in seconds between passes
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(DocumentCache::new(config, Arc::new(MongoConnect))?);
/// let cull_handle = spawn_cull_task(cache.clone(), 60);
/// // Later, during shutdown:
/// cull_handle.abort();
/// ```
pub fn spawn_cull_task(cache: Arc<DocumentCache>, cull_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cull_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting cull task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            match cache.cull().await {
                Ok(0) => debug!("Cull pass: nothing to remove"),
                Ok(removed) => info!("Cull pass: removed {} entries", removed),
                Err(err) => warn!(error = %err, "Cull pass failed"),
            }
        }
    })
}
