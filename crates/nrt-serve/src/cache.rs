//! Size-bounded, single-flight record cache with moka.
//!
//! Sits in front of the record store on the read path. Values are the raw
//! record bytes keyed by the record key string.
//!
//! ## Single flight
//!
//! Concurrent misses on the same key share one loader call: the first caller
//! runs it, the others block until it finishes and receive the same bytes or
//! the same error. A failed load is never cached, so the next `get` retries.
//!
//! ## Staleness
//!
//! Re-ingesting a key replaces the stored bytes without touching the cache.
//! Cached copies stay until evicted, expired by the optional TTL, or dropped
//! with [`RecordCache::invalidate`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use moka::sync::Cache;
use nrt_core::metrics::{CACHE_HITS, CACHE_LOAD_ERRORS, CACHE_LOADS};
use nrt_core::{Error, RecordKey, RecordStore, Result};
use tracing::debug;

/// Default byte budget (1 GB).
pub const DEFAULT_MAX_BYTES: u64 = 1_000_000_000;

/// Source of record bytes on a cache miss.
pub trait RecordLoader: Send + Sync + 'static {
    fn load(&self, key: &RecordKey) -> Result<Bytes>;
}

impl RecordLoader for RecordStore {
    fn load(&self, key: &RecordKey) -> Result<Bytes> {
        self.get_record_by_key(key)
    }
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on the total size of cached keys and values.
    pub max_bytes: u64,
    /// Expire entries this long after they were loaded.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            ttl: None,
        }
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_errors: AtomicU64,
}

/// Record cache over a [`RecordLoader`].
///
/// Cheap to clone; clones share entries and counters.
pub struct RecordCache<L: RecordLoader> {
    entries: Cache<String, Bytes>,
    loader: Arc<L>,
    counters: Arc<Counters>,
}

impl<L: RecordLoader> Clone for RecordCache<L> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            loader: Arc::clone(&self.loader),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<L: RecordLoader> RecordCache<L> {
    pub fn new(loader: Arc<L>, config: &CacheConfig) -> Self {
        let mut builder = Cache::<String, Bytes>::builder()
            .max_capacity(config.max_bytes)
            .weigher(|key: &String, value: &Bytes| -> u32 {
                (key.len() + value.len()).try_into().unwrap_or(u32::MAX)
            });
        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }

        debug!(max_bytes = config.max_bytes, ttl = ?config.ttl, "record cache created");

        Self {
            entries: builder.build(),
            loader,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Fetch the bytes for `key`, loading them at most once across concurrent
    /// callers.
    pub fn get(&self, key: &RecordKey) -> Result<Bytes> {
        let cache_key = key.to_string();

        if let Some(bytes) = self.entries.get(&cache_key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            counter!(CACHE_HITS).increment(1);
            return Ok(bytes);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        self.entries
            .try_get_with(cache_key, || {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                counter!(CACHE_LOADS).increment(1);
                let loaded = self.loader.load(key);
                if let Err(e) = &loaded {
                    self.counters.load_errors.fetch_add(1, Ordering::Relaxed);
                    counter!(CACHE_LOAD_ERRORS).increment(1);
                    debug!(key = %key, error = %e, "record load failed");
                }
                loaded
            })
            .map_err(|shared| Error::from_shared(&shared))
    }

    /// Like [`get`](Self::get) for a key string.
    pub fn get_str(&self, key: &str) -> Result<Bytes> {
        self.get(&RecordKey::parse(key)?)
    }

    /// Drop a cached entry so the next `get` reloads it.
    pub fn invalidate(&self, key: &RecordKey) {
        self.entries.invalidate(&key.to_string());
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries.contains_key(&key.to_string())
    }

    /// Total weight of cached entries in bytes.
    ///
    /// Approximate until pending maintenance has run.
    pub fn weighted_size(&self) -> u64 {
        self.entries.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Apply pending evictions and size bookkeeping now.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_errors: self.counters.load_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nrt_core::StreamId;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Barrier;
    use std::thread;

    /// Loader over a map with a call counter and an optional delay.
    #[derive(Default)]
    struct MapLoader {
        records: Mutex<HashMap<String, Bytes>>,
        calls: AtomicU64,
        delay: Duration,
    }

    impl MapLoader {
        fn with(keys: &[&RecordKey], size: usize, delay: Duration) -> Arc<Self> {
            let records = keys
                .iter()
                .map(|k| (k.to_string(), Bytes::from(vec![7u8; size])))
                .collect();
            Arc::new(Self {
                records: Mutex::new(records),
                calls: AtomicU64::new(0),
                delay,
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecordLoader for MapLoader {
        fn load(&self, key: &RecordKey) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.records
                .lock()
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))
        }
    }

    fn key(second: u32) -> RecordKey {
        RecordKey::new(
            StreamId::new("NZ", "ABAZ", "EHE", "10"),
            Utc.with_ymd_and_hms(2016, 3, 19, 0, 0, second).unwrap(),
        )
    }

    // =========================================================================
    // Single flight
    // =========================================================================

    #[test]
    fn test_concurrent_misses_share_one_load() {
        let k = key(1);
        let loader = MapLoader::with(&[&k], 512, Duration::from_millis(100));
        let cache = RecordCache::new(loader.clone(), &CacheConfig::default());

        let callers = 16;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                let k = k.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&k)
                })
            })
            .collect();

        for handle in handles {
            let bytes = handle.join().unwrap().unwrap();
            assert_eq!(bytes.len(), 512);
        }
        assert_eq!(loader.calls(), 1);
        assert_eq!(cache.stats().loads, 1);
    }

    #[test]
    fn test_concurrent_misses_share_one_error() {
        let loader = MapLoader::with(&[], 0, Duration::from_millis(100));
        let cache = RecordCache::new(loader.clone(), &CacheConfig::default());

        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&key(9))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().unwrap_err().is_not_found());
        }
        assert_eq!(loader.calls(), 1);
    }

    // =========================================================================
    // Hits, errors, eviction
    // =========================================================================

    #[test]
    fn test_hit_after_load() {
        let k = key(1);
        let loader = MapLoader::with(&[&k], 512, Duration::ZERO);
        let cache = RecordCache::new(loader.clone(), &CacheConfig::default());

        cache.get(&k).unwrap();
        cache.get(&k).unwrap();
        cache.get_str("NZ_ABAZ_EHE_10_2016-03-19T00:00:01.000000Z").unwrap();

        assert_eq!(loader.calls(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                loads: 1,
                load_errors: 0
            }
        );
        assert!(cache.contains(&k));
    }

    #[test]
    fn test_errors_are_not_cached() {
        let k = key(2);
        let loader = MapLoader::with(&[], 0, Duration::ZERO);
        let cache = RecordCache::new(loader.clone(), &CacheConfig::default());

        assert!(cache.get(&k).unwrap_err().is_not_found());
        assert!(cache.get(&k).unwrap_err().is_not_found());
        assert_eq!(loader.calls(), 2);
        assert_eq!(cache.stats().load_errors, 2);

        // Once the record exists the next get succeeds.
        loader
            .records
            .lock()
            .insert(k.to_string(), Bytes::from_static(b"late"));
        assert_eq!(cache.get(&k).unwrap(), Bytes::from_static(b"late"));
    }

    #[test]
    fn test_invalid_key_string() {
        let cache = RecordCache::new(MapLoader::with(&[], 0, Duration::ZERO), &CacheConfig::default());
        assert!(matches!(
            cache.get_str("garbage"),
            Err(Error::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_size_bound_evicts() {
        let keys: Vec<RecordKey> = (0..20).map(key).collect();
        let refs: Vec<&RecordKey> = keys.iter().collect();
        let loader = MapLoader::with(&refs, 512, Duration::ZERO);
        let cache = RecordCache::new(
            loader,
            &CacheConfig {
                max_bytes: 4 * 1024,
                ttl: None,
            },
        );

        for k in &keys {
            cache.get(k).unwrap();
        }
        cache.run_pending_tasks();

        assert!(cache.weighted_size() <= 4 * 1024);
        assert!(cache.entry_count() < keys.len() as u64);
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let k = key(3);
        let loader = MapLoader::with(&[&k], 16, Duration::ZERO);
        let cache = RecordCache::new(loader.clone(), &CacheConfig::default());

        cache.get(&k).unwrap();
        cache.invalidate(&k);
        cache.get(&k).unwrap();
        assert_eq!(loader.calls(), 2);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let k = key(4);
        let loader = MapLoader::with(&[&k], 16, Duration::ZERO);
        let cache = RecordCache::new(
            loader.clone(),
            &CacheConfig {
                max_bytes: DEFAULT_MAX_BYTES,
                ttl: Some(Duration::from_millis(50)),
            },
        );

        cache.get(&k).unwrap();
        thread::sleep(Duration::from_millis(150));
        cache.get(&k).unwrap();
        assert_eq!(loader.calls(), 2);
    }
}
