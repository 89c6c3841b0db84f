//! Bounded TTL caches
//!
//! Two users: tool-call response caching and tokenization results. The
//! tokenizer BPE is expensive to run; counts are memoized by content hash.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::hash::hash_content;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Time-to-live cache with a hard capacity bound
pub struct TtlCache<K, V> {
    default_ttl: Duration,
    capacity: usize,
    store: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create a new TTL cache
    pub fn new(default_ttl: Duration, capacity: usize) -> Self {
        Self {
            default_ttl,
            capacity: capacity.max(1),
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a live entry
    pub fn get(&self, key: &K) -> Option<V> {
        let store = self.store.read();
        let entry = store.get(key)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove a live entry and return it
    ///
    /// Single-use entries (pending correlations) go through here so one
    /// lookup consumes them.
    pub fn take(&self, key: &K) -> Option<V> {
        let mut store = self.store.write();
        let entry = store.remove(key)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.value)
    }

    /// Insert with the default TTL
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut store = self.store.write();

        // Over capacity: drop expired entries first, then arbitrary ones
        if store.len() >= self.capacity {
            let now = Instant::now();
            store.retain(|_, entry| entry.expires_at > now);
            while store.len() >= self.capacity {
                let Some(key) = store.keys().next().cloned() else { break };
                store.remove(&key);
            }
        }

        store.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.store
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything
    pub fn clear(&self) {
        self.store.write().clear();
    }
}

/// Token counter with memoized results
pub struct TokenCounter {
    bpe: Option<tiktoken_rs::CoreBPE>,
    cache: TtlCache<String, usize>,
}

impl TokenCounter {
    /// Build a counter for the configured encoding; unknown encodings
    /// disable counting rather than failing startup
    pub fn new(encoding: &str) -> Self {
        let bpe = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base().ok(),
            "o200k_base" => tiktoken_rs::o200k_base().ok(),
            other => {
                tracing::warn!(encoding = %other, "Unknown tokenizer encoding, counts disabled");
                None
            }
        };
        Self {
            bpe,
            cache: TtlCache::new(Duration::from_secs(300), 4096),
        }
    }

    /// Count tokens in a text, memoized by content hash
    pub fn count(&self, text: &str) -> Option<usize> {
        let bpe = self.bpe.as_ref()?;
        let key = hash_content(text.as_bytes());
        if let Some(count) = self.cache.get(&key) {
            return Some(count);
        }
        let count = bpe.encode_with_special_tokens(text).len();
        self.cache.put(key, count);
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_expiration() {
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::from_millis(30), 16);
        cache.put("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn test_take_consumes_the_entry() {
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::from_secs(60), 16);
        cache.put("k", 1);

        assert_eq!(cache.take(&"k"), Some(1));
        assert_eq!(cache.take(&"k"), None);
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn test_capacity_bound() {
        let cache: TtlCache<i32, i32> = TtlCache::new(Duration::from_secs(60), 8);
        for i in 0..100 {
            cache.put(i, i);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_token_counter_is_consistent() {
        let counter = TokenCounter::new("cl100k_base");
        let a = counter.count("hello world, this is a test");
        let b = counter.count("hello world, this is a test");
        assert_eq!(a, b);
        if let Some(count) = a {
            assert!(count > 0);
        }
    }

    #[test]
    fn test_unknown_encoding_disables_counting() {
        let counter = TokenCounter::new("bogus_base");
        assert_eq!(counter.count("text"), None);
    }
}
