use crate::clock::{SharedClock, SystemClock};
use crate::persistence::{
    PersistedEntry, PersistedState, SharedPersistence, SnapshotWriter, STATE_VERSION,
};
use crate::request::Request;
use crate::{Error, SyncConfig};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(feature = "graphql")]
use async_graphql::SimpleObject;

/// Anything that can be cached, shared between tasks, and written to persistent storage.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Configuration for the cache system
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Default time-to-live of an entry
    pub max_age: Duration,
    /// Maximum number of cached entries
    pub max_size: usize,
    /// Whether expired entries are still served
    pub stale_while_revalidate: bool,
    /// Whether caching is enabled
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for CacheConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_size: config.max_size().max(1),
            stale_while_revalidate: config.stale_while_revalidate(),
            enabled: config.enabled(),
        }
    }
}

impl CacheConfig {
    /// Number of entries kept after an eviction sweep: 80% of capacity, rounded up.
    pub fn low_watermark(&self) -> usize {
        ((self.max_size * 4 + 4) / 5).max(1)
    }
}

/// Cache key derived from the method, endpoint and parameters of a request
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        CacheKey(raw.into())
    }

    /// Generate a cache key for a request. Parameters are hashed in sorted order so that the
    /// order in which they were added does not matter.
    pub fn from_request(request: &Request) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(request.method().as_bytes());
        hasher.update(b"\0");
        hasher.update(request.endpoint().as_bytes());
        for (name, value) in request.params() {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Request> for CacheKey {
    fn from(request: &Request) -> Self {
        CacheKey::from_request(request)
    }
}

/// Cached payload with metadata
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    pub etag: Option<String>,
    /// Insertion order, breaks ties between equal `stored_at` values
    sequence: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at > self.ttl
    }
}

/// Result of a cache lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLookup<V> {
    pub value: V,
    pub is_stale: bool,
    pub etag: Option<String>,
}

/// Per-write options for [`RequestCache::set`]
#[derive(Clone, Debug, Default)]
pub struct EntryOptions {
    pub ttl: Option<Duration>,
    pub etag: Option<String>,
}

impl EntryOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Key-indexed response cache with TTL and capacity-based eviction.
///
/// Never performs I/O on lookups. When a [`PersistenceAdapter`](crate::PersistenceAdapter) is
/// attached, every mutation queues a snapshot for it; inside a tokio runtime the write happens
/// on the blocking pool, so call [`flush_persistence`](Self::flush_persistence) before exiting.
pub struct RequestCache<V> {
    cache: DashMap<CacheKey, CacheEntry<V>>,
    sequence: AtomicU64,
    clock: SharedClock,
    persistence: Option<Arc<SnapshotWriter>>,
    /// Orders snapshots the same way they are queued
    snapshot_lock: Mutex<()>,
    pub config: CacheConfig,
}

impl<V: CacheValue> RequestCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            cache: DashMap::new(),
            sequence: AtomicU64::new(0),
            clock,
            persistence: None,
            snapshot_lock: Mutex::new(()),
            config,
        }
    }

    /// Attach a persistence adapter and restore whatever state it holds.
    pub fn with_persistence(mut self, persistence: SharedPersistence) -> Self {
        self.persistence = Some(SnapshotWriter::new(persistence));
        self.restore();
        self
    }

    /// Get the cached value for `key`, flagged stale when its TTL has passed.
    ///
    /// Without stale-while-revalidate an expired entry is dropped and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheLookup<V>> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        let lookup = self.cache.get(key).map(|cached| CacheLookup {
            value: cached.value.clone(),
            is_stale: cached.is_stale(now),
            etag: cached.etag.clone(),
        });

        match lookup {
            Some(lookup) if lookup.is_stale && !self.config.stale_while_revalidate => {
                log::debug!("Cache expired for key: {}", key);
                if self
                    .cache
                    .remove_if(key, |_, cached| cached.is_stale(now))
                    .is_some()
                {
                    self.persist();
                }
                None
            }
            Some(lookup) => {
                log::debug!("Cache hit for key: {} (stale: {})", key, lookup.is_stale);
                Some(lookup)
            }
            None => {
                log::debug!("Cache miss for key: {}", key);
                None
            }
        }
    }

    /// Store or overwrite the entry for `key`
    pub fn set(&self, key: CacheKey, value: V, options: EntryOptions) {
        if !self.config.enabled {
            return;
        }

        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
            ttl: options.ttl.unwrap_or(self.config.max_age),
            etag: options.etag,
            sequence: self.next_sequence(),
        };
        self.cache.insert(key.clone(), entry);
        log::debug!("Stored in cache with key: {}", key);

        if self.cache.len() > self.config.max_size {
            self.evict_oldest();
        }
        self.persist();
    }

    /// Restart the lifetime of an existing entry without touching its payload.
    ///
    /// Returns `false` when there is no entry for `key`.
    pub fn touch(&self, key: &CacheKey, ttl: Option<Duration>) -> bool {
        let now = self.clock.now();
        let sequence = self.next_sequence();
        let touched = match self.cache.get_mut(key) {
            Some(mut cached) => {
                cached.stored_at = now;
                cached.sequence = sequence;
                if let Some(ttl) = ttl {
                    cached.ttl = ttl;
                }
                true
            }
            None => false,
        };

        if touched {
            log::debug!("Refreshed cache entry for key: {}", key);
            self.persist();
        }
        touched
    }

    /// Remove a single entry
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.cache.remove(key).is_some();
        if removed {
            log::debug!("Invalidated cache entry for key: {}", key);
            self.persist();
        }
        removed
    }

    /// Remove expired entries from cache
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.cache.len();
        self.cache.retain(|_, cached| !cached.is_stale(now));
        let expired_count = before.saturating_sub(self.cache.len());

        if expired_count > 0 {
            self.persist();
        }
        log::debug!("Evicted {} expired cache entries", expired_count);
        expired_count
    }

    /// Remove oldest entries until the cache is back at its low watermark
    fn evict_oldest(&self) {
        let mut entries: Vec<_> = self
            .cache
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().stored_at,
                    entry.value().sequence,
                )
            })
            .collect();

        // Sort by storage time (oldest first)
        entries.sort_by_key(|(_, stored_at, sequence)| (*stored_at, *sequence));

        let to_remove = entries.len().saturating_sub(self.config.low_watermark());
        for (key, _, _) in entries.into_iter().take(to_remove) {
            self.cache.remove(&key);
        }

        log::debug!("Evicted {} oldest cache entries", to_remove);
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.cache.clear();
        self.persist();
        log::info!("Cache cleared");
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let total_entries = self.cache.len();
        let stale_entries = self
            .cache
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .count();

        CacheStats {
            total_entries,
            fresh_entries: total_entries.saturating_sub(stale_entries),
            stale_entries,
            max_entries: self.config.max_size,
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self) -> PersistedState<V> {
        let mut entries: Vec<_> = self
            .cache
            .iter()
            .map(|entry| {
                let cached = entry.value();
                (
                    cached.sequence,
                    PersistedEntry {
                        key: entry.key().clone(),
                        value: cached.value.clone(),
                        stored_at: cached.stored_at,
                        ttl_ms: cached.ttl.num_milliseconds(),
                        etag: cached.etag.clone(),
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(sequence, _)| *sequence);

        PersistedState {
            version: STATE_VERSION,
            entries: entries.into_iter().map(|(_, entry)| entry).collect(),
        }
    }

    /// Write any snapshot still queued for the persistence adapter.
    pub fn flush_persistence(&self) {
        if let Some(writer) = &self.persistence {
            writer.flush();
        }
    }

    fn persist(&self) {
        let Some(writer) = &self.persistence else {
            return;
        };

        let _ordered = self
            .snapshot_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match serde_json::to_string(&self.snapshot()) {
            Ok(serialized) => writer.submit(serialized),
            Err(e) => log::warn!(
                "Failed to persist cache state: {}",
                Error::Persistence(e.to_string())
            ),
        }
    }

    fn restore(&self) {
        let Some(writer) = &self.persistence else {
            return;
        };
        let persistence: &SharedPersistence = writer.adapter();

        let state = match persistence.load().and_then(|raw| match raw {
            Some(raw) => PersistedState::<V>::decode(&raw).map(Some),
            None => Ok(None),
        }) {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Starting with an empty cache: {}", e);
                return;
            }
        };

        let now = self.clock.now();
        let mut entries = state.entries;
        entries.sort_by_key(|entry| entry.stored_at);

        let mut dropped = 0;
        for entry in entries {
            let cached = CacheEntry {
                value: entry.value,
                stored_at: entry.stored_at,
                ttl: Duration::milliseconds(entry.ttl_ms),
                etag: entry.etag,
                sequence: self.next_sequence(),
            };
            if cached.is_stale(now) {
                dropped += 1;
                continue;
            }
            self.cache.insert(entry.key, cached);
        }

        if self.cache.len() > self.config.max_size {
            self.evict_oldest();
        }
        log::info!(
            "Restored {} cache entries ({} expired entries dropped)",
            self.cache.len(),
            dropped
        );
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(SimpleObject))]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub max_entries: usize,
}

/// Thread-safe wrapper for the cache
pub type SharedRequestCache<V> = Arc<RequestCache<V>>;
