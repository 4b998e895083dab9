//! Key Normalizer Module
//!
//! Turns an application key plus version into a key that is safe to store
//! and query in MongoDB.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::cache::MAX_KEY_LENGTH;
use crate::error::{CacheError, Result};

/// Characters with special meaning to MongoDB: `.` is the field path
/// separator and `$` prefixes operators.
const DISALLOWED: [char; 3] = ['.', '$', '\0'];

/// Replacement used by [`KeyScheme::Substitute`].
pub const SUBSTITUTE_CHAR: char = '_';

/// Set encoded by [`KeyScheme::Escape`]. `%` is included so an escaped key
/// never collides with a raw key that already looks escaped.
const ESCAPED: &AsciiSet = &CONTROLS.add(b'.').add(b'$').add(b'%');

// == Key Scheme ==
/// How disallowed characters are made safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScheme {
    /// Replace each disallowed character with `_`.
    ///
    /// Lossy: `user.1`, `user$1` and `user_1` map to the same storage key
    /// and will overwrite each other.
    #[default]
    Substitute,
    /// Drop each disallowed character, so `user.1` is stored as `user1`.
    ///
    /// Lossy like `Substitute`. This is the form written by caches that
    /// strip rather than replace, so pick it to share keys with them.
    Strip,
    /// Percent-encode `%`, control characters, non-ASCII bytes and each
    /// disallowed character. Injective.
    Escape,
}

impl FromStr for KeyScheme {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substitute" => Ok(KeyScheme::Substitute),
            "strip" => Ok(KeyScheme::Strip),
            "escape" => Ok(KeyScheme::Escape),
            other => Err(CacheError::Configuration(format!(
                "unknown key scheme '{}', expected 'substitute', 'strip' or 'escape'",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScheme::Substitute => f.write_str("substitute"),
            KeyScheme::Strip => f.write_str("strip"),
            KeyScheme::Escape => f.write_str("escape"),
        }
    }
}

// == Key Normalizer ==
/// Builds `"{prefix}:{version}:{key}"` and makes it store-safe.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    prefix: String,
    default_version: i64,
    scheme: KeyScheme,
}

impl KeyNormalizer {
    pub fn new(prefix: impl Into<String>, default_version: i64, scheme: KeyScheme) -> Self {
        Self {
            prefix: prefix.into(),
            default_version,
            scheme,
        }
    }

    // == Normalize ==
    /// Produces the storage key for `raw_key`.
    ///
    /// # Arguments
    /// * `raw_key` - Key supplied by the application
    /// * `version` - Key version, or None for the configured default
    ///
    /// # Errors
    /// `InvalidKey` if `raw_key` is empty or the result exceeds
    /// [`MAX_KEY_LENGTH`] bytes.
    pub fn normalize(&self, raw_key: &str, version: Option<i64>) -> Result<String> {
        if raw_key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }

        let version = version.unwrap_or(self.default_version);
        let versioned = format!("{}:{}:{}", self.prefix, version, raw_key);

        let key = match self.scheme {
            KeyScheme::Substitute => substitute(&versioned),
            KeyScheme::Strip => versioned.replace(DISALLOWED, ""),
            KeyScheme::Escape => utf8_percent_encode(&versioned, ESCAPED).to_string(),
        };

        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidKey(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            )));
        }

        Ok(key)
    }
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new("", 1, KeyScheme::default())
    }
}

fn substitute(key: &str) -> String {
    key.chars()
        .map(|c| if DISALLOWED.contains(&c) { SUBSTITUTE_CHAR } else { c })
        .collect()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_key_format() {
        let keys = KeyNormalizer::new("app", 1, KeyScheme::Substitute);
        assert_eq!(keys.normalize("user", None).unwrap(), "app:1:user");
        assert_eq!(keys.normalize("user", Some(7)).unwrap(), "app:7:user");
    }

    #[test]
    fn test_substitute_replaces_disallowed() {
        let keys = KeyNormalizer::default();
        assert_eq!(keys.normalize("a.b$c", None).unwrap(), ":1:a_b_c");
    }

    #[test]
    fn test_substitute_collides() {
        // Documented loss: distinct raw keys share a storage key
        let keys = KeyNormalizer::default();
        assert_eq!(
            keys.normalize("user.1", None).unwrap(),
            keys.normalize("user$1", None).unwrap()
        );
        assert_eq!(
            keys.normalize("user.1", None).unwrap(),
            keys.normalize("user_1", None).unwrap()
        );
    }

    #[test]
    fn test_strip_drops_disallowed() {
        let keys = KeyNormalizer::new("app", 1, KeyScheme::Strip);
        assert_eq!(keys.normalize("a.b$c", None).unwrap(), "app:1:abc");
        assert_eq!(keys.normalize("nul\0byte", None).unwrap(), "app:1:nulbyte");
        assert_eq!(keys.normalize("plain", None).unwrap(), "app:1:plain");
    }

    #[test]
    fn test_strip_collides() {
        let keys = KeyNormalizer::new("", 1, KeyScheme::Strip);
        assert_eq!(
            keys.normalize("user.1", None).unwrap(),
            keys.normalize("user1", None).unwrap()
        );
        assert_ne!(
            keys.normalize("user.1", None).unwrap(),
            KeyNormalizer::default().normalize("user.1", None).unwrap()
        );
    }

    #[test]
    fn test_escape_encodes_controls_and_non_ascii() {
        let keys = KeyNormalizer::new("", 1, KeyScheme::Escape);
        assert_eq!(keys.normalize("a\0b", None).unwrap(), ":1:a%00b");
        assert_eq!(keys.normalize("caf\u{e9}", None).unwrap(), ":1:caf%C3%A9");
    }

    #[test]
    fn test_escape_is_injective_on_collision_cases() {
        let keys = KeyNormalizer::new("", 1, KeyScheme::Escape);
        let dotted = keys.normalize("user.1", None).unwrap();
        let dollar = keys.normalize("user$1", None).unwrap();
        let plain = keys.normalize("user_1", None).unwrap();
        let literal = keys.normalize("user%2E1", None).unwrap();

        assert_eq!(dotted, ":1:user%2E1");
        assert_eq!(dollar, ":1:user%241");
        assert_eq!(literal, ":1:user%252E1");
        assert_ne!(dotted, dollar);
        assert_ne!(dotted, plain);
        assert_ne!(dotted, literal);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let keys = KeyNormalizer::new("p", 2, KeyScheme::Escape);
        assert_eq!(
            keys.normalize("x.y", None).unwrap(),
            keys.normalize("x.y", None).unwrap()
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        let keys = KeyNormalizer::default();
        assert!(matches!(keys.normalize("", None), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_key_too_long() {
        let keys = KeyNormalizer::default();
        let long_key = "x".repeat(MAX_KEY_LENGTH);

        let result = keys.normalize(&long_key, None);
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_escape_growth_counts_toward_limit() {
        let keys = KeyNormalizer::new("", 1, KeyScheme::Escape);
        // 100 dots become 300 bytes once escaped
        let dotted = ".".repeat(100);
        assert!(matches!(keys.normalize(&dotted, None), Err(CacheError::InvalidKey(_))));
        assert!(KeyNormalizer::default().normalize(&dotted, None).is_ok());
    }

    #[test]
    fn test_scheme_from_str() {
        assert_eq!("substitute".parse::<KeyScheme>().unwrap(), KeyScheme::Substitute);
        assert_eq!("STRIP".parse::<KeyScheme>().unwrap(), KeyScheme::Strip);
        assert_eq!(" Escape ".parse::<KeyScheme>().unwrap(), KeyScheme::Escape);
        assert_eq!(KeyScheme::Strip.to_string(), "strip");
        assert!(matches!(
            "base64".parse::<KeyScheme>(),
            Err(CacheError::Configuration(_))
        ));
    }
}
