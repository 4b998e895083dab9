//! Cache Entry Module
//!
//! Defines the stored document shape and the liveness rule applied on reads.

use std::time::Duration;

use chrono::{DateTime, Utc};

// == Timeout ==
/// Per-call expiry request for `add`/`set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use the ttl configured for the cache
    #[default]
    Default,
    /// Never expire via the `expires` field
    Never,
    /// Expire this long after the write
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(ttl: Duration) -> Self {
        Timeout::After(ttl)
    }
}

// == Cache Entry ==
/// A single cached document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Normalized storage key, unique within a collection
    pub key: String,
    /// Opaque payload, written and read back verbatim
    pub data: Vec<u8>,
    /// Absolute expiry, None = never expires via the field check
    pub expires: Option<DateTime<Utc>>,
    /// Time of the most recent write
    pub last_change: DateTime<Utc>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry written at `now`.
    ///
    /// # Arguments
    /// * `key` - Normalized storage key
    /// * `data` - Payload bytes
    /// * `expires` - Absolute expiry, if any
    /// * `now` - Write time, recorded as `last_change`
    pub fn new(
        key: impl Into<String>,
        data: Vec<u8>,
        expires: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            data,
            expires,
            last_change: now,
        }
    }

    // == Is Live ==
    /// Liveness filter: `expires is null OR expires > now`.
    ///
    /// Boundary condition: an entry whose `expires` equals `now` is already
    /// gone, so that a zero-second TTL never produces a readable entry.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(expires) => expires > now,
            None => true,
        }
    }

    /// Inverse of [`is_live_at`](Self::is_live_at) for entries that carry an
    /// expiry. Entries without one are never expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(expires) if expires <= now)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_entry_without_expiry_is_always_live() {
        let entry = CacheEntry::new("k", b"v".to_vec(), None, at(0));

        assert!(entry.is_live_at(at(0)));
        assert!(entry.is_live_at(at(1_000_000)));
        assert!(!entry.is_expired_at(at(1_000_000)));
    }

    #[test]
    fn test_entry_expiration() {
        let entry = CacheEntry::new("k", b"v".to_vec(), Some(at(10)), at(0));

        assert!(entry.is_live_at(at(9)));
        assert!(!entry.is_live_at(at(11)));
        assert!(entry.is_expired_at(at(11)));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = CacheEntry::new("k", b"v".to_vec(), Some(at(10)), at(0));

        // Entry is gone once now == expires
        assert!(!entry.is_live_at(at(10)), "Entry should be expired at boundary");
        assert!(entry.is_expired_at(at(10)));
    }

    #[test]
    fn test_timeout_from_duration() {
        let timeout: Timeout = Duration::from_secs(5).into();
        assert_eq!(timeout, Timeout::After(Duration::from_secs(5)));
        assert_eq!(Timeout::default(), Timeout::Default);
    }
}
