//! Retry Wrapper Module
//!
//! Re-runs a store call on reconnect-class failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{CacheError, Result};
use crate::store::StoreResult;

// == Backoff ==
/// Delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry without waiting
    #[default]
    Immediate,
    /// Wait a fixed delay before each retry
    Fixed(Duration),
}

impl Backoff {
    fn delay(&self) -> Duration {
        match self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
        }
    }
}

// == Retry ==
/// Bounded retry for a single store call.
///
/// Transient failures are retried until `attempts` calls have been made,
/// then surface as [`CacheError::ConnectionExhausted`]. Any other store
/// failure surfaces immediately as [`CacheError::StoreOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    attempts: u32,
    backoff: Backoff,
}

impl Retry {
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    /// `attempts` counts the first call; values below 1 are raised to 1.
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // == Run ==
    /// Executes `call`, retrying transient failures.
    ///
    /// # Arguments
    /// * `operation` - Name used in log lines
    /// * `call` - Produces a fresh future for each attempt
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= self.attempts {
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "Store still unreachable, giving up"
                        );
                        return Err(CacheError::ConnectionExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }

                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        error = %err,
                        "Transient store failure, retrying"
                    );

                    let delay = self.backoff.delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(CacheError::StoreOperation(err)),
            }
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Backoff::Immediate)
    }
}
