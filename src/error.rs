//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

use crate::store::StoreError;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key is empty or too long after normalization. Never reaches the store.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Conflicting or missing eviction policy, or provisioning failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The store could not be reached when opening the collection
    #[error("Connection error: {0}")]
    Connection(String),

    /// A transient failure persisted through every retry attempt
    #[error("Store unreachable after {attempts} attempts: {source}")]
    ConnectionExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Non-transient failure reported by the store
    #[error("Store operation failed: {0}")]
    StoreOperation(#[from] StoreError),

    /// Value could not be encoded or decoded as JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns true for failures that originate in the store rather than in
    /// caller input or configuration.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Connection(_)
                | CacheError::ConnectionExhausted { .. }
                | CacheError::StoreOperation(_)
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_classified() {
        assert!(CacheError::Connection("down".into()).is_store_failure());
        assert!(CacheError::StoreOperation(StoreError::Operation("dup".into())).is_store_failure());
        assert!(CacheError::ConnectionExhausted {
            attempts: 3,
            source: StoreError::Transient("reset".into()),
        }
        .is_store_failure());

        assert!(!CacheError::InvalidKey("".into()).is_store_failure());
        assert!(!CacheError::Configuration("both".into()).is_store_failure());
    }

    #[test]
    fn test_exhausted_message_names_attempts() {
        let err = CacheError::ConnectionExhausted {
            attempts: 3,
            source: StoreError::Transient("connection reset".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
