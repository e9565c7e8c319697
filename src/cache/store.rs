//! Bounded in-memory implementation of [`Cache`].

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::lock::{read_or_recover, write_or_recover};
use super::{Cache, CacheError};

const METRIC_HIT: &str = "cache_triage_memory_hit_total";
const METRIC_MISS: &str = "cache_triage_memory_miss_total";
const METRIC_EVICT: &str = "cache_triage_memory_evict_total";

/// LRU-bounded cache keyed by request cache key.
///
/// Every operation takes the lock for a single call only; a read followed by
/// an update is not atomic with respect to other callers.
pub struct MemoryCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
    initialized: AtomicBool,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.capacity_non_zero())),
            initialized: AtomicBool::new(false),
        }
    }

    /// Build a cache preloaded with `entries`, in order.
    pub fn with_entries<I, K>(config: &CacheConfig, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, CacheEntry)>,
        K: Into<String>,
    {
        let cache = Self::new(config);
        for (key, entry) in entries {
            cache.update(&key.into(), entry);
        }
        cache
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        write_or_recover(&self.entries, "remove").pop(key)
    }

    pub fn clear(&self) {
        write_or_recover(&self.entries, "clear").clear();
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.entries, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`Cache::initialize`] has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl Cache for MemoryCache {
    fn initialize(&self) -> Result<(), CacheError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(CacheError::AlreadyInitialized);
        }
        debug!(entries = self.len(), "Memory cache initialized");
        Ok(())
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = write_or_recover(&self.entries, "get").get(key).cloned();
        match entry {
            Some(_) => counter!(METRIC_HIT).increment(1),
            None => counter!(METRIC_MISS).increment(1),
        }
        entry
    }

    fn get_headers(&self, key: &str) -> Option<CacheEntry> {
        // Peek so that metadata queries do not disturb recency order.
        read_or_recover(&self.entries, "get_headers")
            .peek(key)
            .map(CacheEntry::headers_only)
    }

    fn update(&self, key: &str, entry: CacheEntry) {
        let mut entries = write_or_recover(&self.entries, "update");
        if let Some((evicted, _)) = entries.push(key.to_string(), entry)
            && evicted != key
        {
            counter!(METRIC_EVICT).increment(1);
            debug!(evicted_key = %evicted, "Memory cache evicted entry");
        }
    }

    fn update_metadata(&self, key: &str, metadata: &CacheEntry) -> bool {
        let mut entries = write_or_recover(&self.entries, "update_metadata");
        let Some(stored) = entries.peek_mut(key) else {
            return false;
        };
        stored.etag.clone_from(&metadata.etag);
        stored.response_headers.clone_from(&metadata.response_headers);
        stored.expires_at = metadata.expires_at;
        stored.soft_expires_at = metadata.soft_expires_at;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::time::Duration;

    use super::*;

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry::new(body, Duration::from_secs(60), Duration::from_secs(30))
    }

    #[test]
    fn update_then_get_roundtrip() {
        let cache = MemoryCache::new(&CacheConfig::default());
        assert!(cache.get("a").is_none());

        cache.update("a", entry("alpha"));

        let cached = cache.get("a").expect("cached entry");
        assert_eq!(cached.data, "alpha");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_headers_omits_payload() {
        let cache = MemoryCache::with_entries(&CacheConfig::default(), [("a", entry("alpha"))]);
        let headers = cache.get_headers("a").expect("headers");
        assert!(headers.data.is_empty());
        assert!(cache.get_headers("missing").is_none());
    }

    #[test]
    fn update_replaces_payload_even_when_empty() {
        let cache = MemoryCache::with_entries(&CacheConfig::default(), [("a", entry("alpha"))]);

        cache.update("a", entry(""));

        let stored = cache.get("a").expect("entry");
        assert!(stored.data.is_empty());
    }

    #[test]
    fn metadata_update_preserves_payload() {
        let cache = MemoryCache::with_entries(&CacheConfig::default(), [("a", entry("alpha"))]);

        let mut headers = cache.get_headers("a").expect("headers");
        headers.expire();
        headers.etag = Some("\"v2\"".to_string());
        assert!(cache.update_metadata("a", &headers));

        let stored = cache.get("a").expect("entry");
        assert_eq!(stored.data, "alpha");
        assert_eq!(stored.etag.as_deref(), Some("\"v2\""));
        assert!(stored.is_expired());
    }

    #[test]
    fn metadata_update_of_absent_key_stores_nothing() {
        let cache = MemoryCache::new(&CacheConfig::default());
        let metadata = entry("ignored").headers_only();

        assert!(!cache.update_metadata("missing", &metadata));
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_drops_least_recent() {
        let cache = MemoryCache::new(&CacheConfig { capacity: 2 });
        cache.update("a", entry("alpha"));
        cache.update("b", entry("beta"));
        assert!(cache.get("a").is_some());

        cache.update("c", entry("gamma"));

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn remove_and_clear() {
        let cache = MemoryCache::with_entries(
            &CacheConfig::default(),
            [("a", entry("alpha")), ("b", entry("beta"))],
        );
        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn initialize_runs_once() {
        let cache = MemoryCache::new(&CacheConfig::default());
        assert!(!cache.is_initialized());
        cache.initialize().expect("first initialize");
        assert!(cache.is_initialized());
        assert!(matches!(
            cache.initialize(),
            Err(CacheError::AlreadyInitialized)
        ));
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let cache = MemoryCache::new(&CacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        cache.update("a", entry("alpha"));
        assert!(cache.get("a").is_some());
    }
}
