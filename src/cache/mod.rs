//! Cache Module
//!
//! The cache engine and the pieces it is built from: key normalization,
//! entry liveness, culling and statistics.

mod clock;
mod cull;
mod engine;
mod entry;
mod key;
mod stats;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use clock::{Clock, ManualClock, SystemClock};
pub use cull::{CullStrategy, RemovalStrategy};
pub use engine::{DocumentCache, VersionedCache};
pub use entry::{CacheEntry, Timeout};
pub use key::{KeyNormalizer, KeyScheme, SUBSTITUTE_CHAR};
pub use stats::{CacheStats, StatsRecorder};

// == Public Constants ==
/// Maximum allowed storage key length in bytes, after normalization
pub const MAX_KEY_LENGTH: usize = 250;
