//! Mongo Cache - maintenance process
//!
//! Connects to the configured collection, provisions it if needed and runs
//! the periodic cull task until shut down.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mongo_cache::{spawn_cull_task, CacheConfig, DocumentCache, MongoConnect};

/// Main entry point for the cache maintenance process.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the cache and provision its collection
/// 4. Start background cull task
/// 5. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mongo_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mongo Cache");

    // Load configuration from environment variables
    let config = CacheConfig::from_env();
    info!(
        "Configuration loaded: host={}:{}, database={}, collection={}, cull_interval={}s",
        config.host, config.port, config.database, config.collection, config.cull_interval
    );
    let cull_interval = config.cull_interval;

    let cache = match DocumentCache::new(config, Arc::new(MongoConnect)) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            error!(error = %err, "Invalid cache configuration");
            return Err(err.into());
        }
    };
    info!(policy = ?cache.policy(), "Cache created");

    cache
        .connect()
        .await
        .context("failed to open the cache collection")?;
    info!("Cache collection ready");

    // Start background cull task
    let cull_handle = spawn_cull_task(cache.clone(), cull_interval);
    info!("Background cull task started");

    shutdown_signal(cull_handle).await?;

    let stats = cache.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        culled = stats.culled,
        "Shutdown complete"
    );
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the cull task.
async fn shutdown_signal(cull_handle: tokio::task::JoinHandle<()>) -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Abort the cull task
    cull_handle.abort();
    warn!("Cull task aborted");
    Ok(())
}
