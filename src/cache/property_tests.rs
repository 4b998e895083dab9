//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the cache engine against arbitrary keys, values
//! and operation sequences, driving the async API with `tokio_test`.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{DocumentCache, KeyNormalizer, KeyScheme, Timeout, MAX_KEY_LENGTH};
use crate::config::CacheConfig;
use crate::store::MemoryStore;

// == Test Configuration ==
const TEST_TTL: u64 = 300;

fn expiry_cache() -> DocumentCache {
    let config = CacheConfig {
        ttl: Some(TEST_TTL),
        ..CacheConfig::default()
    };
    DocumentCache::new(config, Arc::new(MemoryStore::new())).unwrap()
}

fn capacity_cache(max_entries: u64, cull_frequency: u32, capped: bool) -> (DocumentCache, MemoryStore) {
    let store = MemoryStore::new();
    if !capped {
        // A pre-existing plain collection makes the engine cull by itself
        tokio_test::block_on(crate::store::DocumentStore::create_collection(
            &store,
            "cache_entries",
            crate::store::CollectionLayout::Unbounded,
        ))
        .unwrap();
    }
    let config = CacheConfig {
        ttl: None,
        max_entries: Some(max_entries),
        cull_frequency,
        ..CacheConfig::default()
    };
    let cache = DocumentCache::new(config, Arc::new(store.clone())).unwrap();
    (cache, store)
}

// == Strategies ==
/// Generates keys that never collide under substitution
fn plain_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_:-]{1,64}".prop_map(|s| s)
}

/// Generates keys that may carry characters the store rejects
fn any_key_strategy() -> impl Strategy<Value = String> {
    "[a-z.$\u{0}%:]{1,48}".prop_map(|s| s)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: String, value: Vec<u8> },
    Add { key: String, value: Vec<u8> },
    Get { key: String },
    Delete { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    // A small key space so operations actually interact
    let key = "k[0-7]".prop_map(|s| s);
    prop_oneof![
        (key.clone(), value_strategy()).prop_map(|(key, value)| CacheOp::Set { key, value }),
        (key.clone(), value_strategy()).prop_map(|(key, value)| CacheOp::Add { key, value }),
        key.clone().prop_map(|key| CacheOp::Get { key }),
        key.prop_map(|key| CacheOp::Delete { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // A value written with set is read back byte for byte.
    #[test]
    fn prop_set_get_round_trip(key in plain_key_strategy(), value in value_strategy()) {
        let cache = expiry_cache();
        tokio_test::block_on(async {
            prop_assert!(cache.set(&key, &value, Timeout::Default).await.unwrap());
            prop_assert_eq!(cache.get(&key).await.unwrap(), Some(value));
            Ok(())
        })?;
    }

    // A second set replaces the first; a second add does not.
    #[test]
    fn prop_set_overwrites_add_keeps_first(
        key in plain_key_strategy(),
        first in value_strategy(),
        second in value_strategy(),
    ) {
        let cache = expiry_cache();
        tokio_test::block_on(async {
            prop_assert!(cache.add(&key, &first, Timeout::Default).await.unwrap());
            prop_assert!(!cache.add(&key, &second, Timeout::Default).await.unwrap());
            prop_assert_eq!(cache.get(&key).await.unwrap(), Some(first));

            prop_assert!(cache.set(&key, &second, Timeout::Default).await.unwrap());
            prop_assert_eq!(cache.get(&key).await.unwrap(), Some(second));
            Ok(())
        })?;
    }

    // After delete the key is gone for every read path.
    #[test]
    fn prop_delete_removes(key in plain_key_strategy(), value in value_strategy()) {
        let cache = expiry_cache();
        tokio_test::block_on(async {
            cache.set(&key, &value, Timeout::Default).await.unwrap();
            prop_assert!(cache.delete(&key).await.unwrap());
            prop_assert!(!cache.has_key(&key).await.unwrap());
            prop_assert_eq!(cache.get(&key).await.unwrap(), None);
            prop_assert!(cache.get_many([key.as_str()]).await.unwrap().is_empty());
            Ok(())
        })?;
    }

    // The engine agrees with a plain map over any operation sequence.
    #[test]
    fn prop_matches_model(ops in prop::collection::vec(cache_op_strategy(), 1..40)) {
        let cache = expiry_cache();
        let mut model: HashMap<String, Vec<u8>> = HashMap::new();

        tokio_test::block_on(async {
            for op in ops {
                match op {
                    CacheOp::Set { key, value } => {
                        prop_assert!(cache.set(&key, &value, Timeout::Default).await.unwrap());
                        model.insert(key, value);
                    }
                    CacheOp::Add { key, value } => {
                        let added = cache.add(&key, &value, Timeout::Default).await.unwrap();
                        prop_assert_eq!(added, !model.contains_key(&key));
                        model.entry(key).or_insert(value);
                    }
                    CacheOp::Get { key } => {
                        prop_assert_eq!(cache.get(&key).await.unwrap(), model.get(&key).cloned());
                    }
                    CacheOp::Delete { key } => {
                        let deleted = cache.delete(&key).await.unwrap();
                        prop_assert_eq!(deleted, model.remove(&key).is_some());
                    }
                }
            }
            Ok(())
        })?;
    }

    // However many distinct keys are written, at most max_entries stay readable.
    #[test]
    fn prop_capacity_bound_holds(
        max_entries in 1u64..16,
        cull_frequency in 0u32..5,
        capped in any::<bool>(),
        writes in 1usize..48,
    ) {
        let (cache, _store) = capacity_cache(max_entries, cull_frequency, capped);
        let keys: Vec<String> = (0..writes).map(|i| format!("key{}", i)).collect();

        tokio_test::block_on(async {
            for key in &keys {
                prop_assert!(cache.set(key, b"v", Timeout::Default).await.unwrap());
            }
            let readable = cache.get_many(&keys).await.unwrap();
            prop_assert!(readable.len() as u64 <= max_entries);
            // The latest write always survives
            prop_assert!(readable.contains_key(&keys[writes - 1]));
            Ok(())
        })?;
    }

    // Any key round-trips through the cache under either scheme, and the
    // stored form never carries a character the store rejects.
    #[test]
    fn prop_normalized_keys_are_storable(
        key in "[a-z:]{1,8}[a-z.$\u{0}%:]{0,40}",
        scheme in prop_oneof![
            Just(KeyScheme::Substitute),
            Just(KeyScheme::Strip),
            Just(KeyScheme::Escape),
        ],
    ) {
        let normalizer = KeyNormalizer::new("app", 1, scheme);

        let storage_key = normalizer.normalize(&key, None).unwrap();
        prop_assert!(!storage_key.contains(['.', '$', '\0']));
        prop_assert!(storage_key.len() <= MAX_KEY_LENGTH);
        prop_assert_eq!(normalizer.normalize(&key, None).unwrap(), storage_key);

        let config = CacheConfig {
            key_prefix: "app".to_string(),
            key_scheme: scheme,
            ..CacheConfig::default()
        };
        let cache = DocumentCache::new(config, Arc::new(MemoryStore::new())).unwrap();
        tokio_test::block_on(async {
            prop_assert!(cache.set(&key, b"payload", Timeout::Default).await.unwrap());
            prop_assert_eq!(cache.get(&key).await.unwrap(), Some(b"payload".to_vec()));
            Ok(())
        })?;
    }

    // Escaping is injective: distinct keys never share a storage key.
    #[test]
    fn prop_escape_scheme_is_injective(a in any_key_strategy(), b in any_key_strategy()) {
        prop_assume!(a != b);
        let normalizer = KeyNormalizer::new("", 1, KeyScheme::Escape);
        prop_assert_ne!(
            normalizer.normalize(&a, None).unwrap(),
            normalizer.normalize(&b, None).unwrap()
        );
    }
}
