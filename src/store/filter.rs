//! Entry filters shared by every backend.

use chrono::{DateTime, Utc};

use crate::cache::CacheEntry;

/// Which keys a filter selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    Any,
    Exact(String),
    In(Vec<String>),
}

/// Which expiry states a filter selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Any,
    /// `expires is null OR expires > at`
    LiveAt(DateTime<Utc>),
    /// `expires <= at`
    ExpiredAt(DateTime<Utc>),
}

/// A conjunction of a key match and a liveness condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    pub keys: KeyMatch,
    pub liveness: Liveness,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self {
            keys: KeyMatch::Any,
            liveness: Liveness::Any,
        }
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self {
            keys: KeyMatch::Exact(key.into()),
            liveness: Liveness::Any,
        }
    }

    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys: KeyMatch::In(keys),
            liveness: Liveness::Any,
        }
    }

    pub fn live_at(mut self, now: DateTime<Utc>) -> Self {
        self.liveness = Liveness::LiveAt(now);
        self
    }

    pub fn expired_at(mut self, now: DateTime<Utc>) -> Self {
        self.liveness = Liveness::ExpiredAt(now);
        self
    }

    /// Evaluates the filter against an entry in memory.
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        let key_ok = match &self.keys {
            KeyMatch::Any => true,
            KeyMatch::Exact(key) => entry.key == *key,
            KeyMatch::In(keys) => keys.iter().any(|k| *k == entry.key),
        };

        key_ok
            && match self.liveness {
                Liveness::Any => true,
                Liveness::LiveAt(now) => entry.is_live_at(now),
                Liveness::ExpiredAt(now) => entry.is_expired_at(now),
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_key_matching() {
        let entry = CacheEntry::new("a", vec![], None, at(0));

        assert!(EntryFilter::all().matches(&entry));
        assert!(EntryFilter::key("a").matches(&entry));
        assert!(!EntryFilter::key("b").matches(&entry));
        assert!(EntryFilter::keys(vec!["b".into(), "a".into()]).matches(&entry));
        assert!(!EntryFilter::keys(vec![]).matches(&entry));
    }

    #[test]
    fn test_liveness_matching() {
        let permanent = CacheEntry::new("p", vec![], None, at(0));
        let expiring = CacheEntry::new("e", vec![], Some(at(10)), at(0));

        let live = EntryFilter::all().live_at(at(10));
        assert!(live.matches(&permanent));
        assert!(!live.matches(&expiring));

        let expired = EntryFilter::all().expired_at(at(10));
        assert!(!expired.matches(&permanent));
        assert!(expired.matches(&expiring));

        assert!(EntryFilter::all().live_at(at(9)).matches(&expiring));
    }
}
