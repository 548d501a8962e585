pub mod batch;
pub mod cache;
pub mod clock;
mod config;
pub mod deduplication;
mod error;
pub mod persistence;
pub mod polling;
mod request;
pub mod revalidation;
pub mod visibility;


pub use batch::{BatchAggregator, BatchFn};
use cache::SharedRequestCache;
pub use cache::{CacheConfig, CacheKey, CacheLookup, CacheStats, CacheValue, EntryOptions, RequestCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SyncConfig;
pub use deduplication::{DeduplicationConfig, DeduplicationStats, RequestDeduplicator};
pub use error::Error;
pub use error::ErrorKind;
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceAdapter, SharedPersistence};
pub use polling::{PollCallback, PollingScheduler};
pub use request::{RawResponse, Request, RequestFn, IF_NONE_MATCH, NOT_MODIFIED};
pub use revalidation::{RevalidationCoordinator, SharedRequestFn};
pub use visibility::{AlwaysVisible, Visibility, VisibilityController, VisibilitySource};

use std::sync::Arc;

/// Cached, deduplicated and polled access to dashboard data, built from one [`SyncConfig`].
pub struct SyncClient<V> {
    coordinator: RevalidationCoordinator<V>,
    scheduler: PollingScheduler,
    config: SyncConfig,
}

impl<V: CacheValue> SyncClient<V> {
    /// Create a client with an in-memory cache
    pub fn new(config: SyncConfig, request_fn: SharedRequestFn<V>) -> Result<Self, Error> {
        config.validate()?;
        let cache = Arc::new(RequestCache::new(CacheConfig::from(&config)));
        Ok(Self::from_parts(config, cache, request_fn))
    }

    /// Create a client whose cache is restored from, and saved to, `persistence`
    pub fn with_persistence(
        config: SyncConfig,
        request_fn: SharedRequestFn<V>,
        persistence: SharedPersistence,
    ) -> Result<Self, Error> {
        config.validate()?;
        let cache = RequestCache::new(CacheConfig::from(&config)).with_persistence(persistence);
        Ok(Self::from_parts(config, Arc::new(cache), request_fn))
    }

    /// Assemble a client around an existing cache
    pub fn from_parts(
        config: SyncConfig,
        cache: SharedRequestCache<V>,
        request_fn: SharedRequestFn<V>,
    ) -> Self {
        log::info!(
            "Initialized SyncClient (max entries: {}, max age: {}ms, stale-while-revalidate: {})",
            config.max_size(),
            config.max_age_ms(),
            config.stale_while_revalidate()
        );
        Self {
            coordinator: RevalidationCoordinator::new(cache, request_fn),
            scheduler: PollingScheduler::new(),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RevalidationCoordinator<V> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    /// Resolve a request through the cache
    pub async fn fetch(&self, request: Request) -> Result<V, Error> {
        self.coordinator.fetch(request).await
    }

    pub fn invalidate(&self, request: &Request) -> bool {
        self.coordinator.invalidate(request)
    }

    /// Poll `request` under the task name `name` at the interval configured for that name,
    /// handing every snapshot to `handler`.
    ///
    /// Each tick refreshes the cached value (conditionally when an entity tag is known), so
    /// `fetch` callers see what the poller last saw.
    pub fn poll<H>(&self, name: impl Into<String>, request: Request, handler: H) -> Result<(), Error>
    where
        H: Fn(V) + Send + Sync + 'static,
    {
        let name = name.into();
        let interval = self.config.poll_interval(&name);
        let coordinator = self.coordinator.clone();
        let handler = Arc::new(handler);

        self.scheduler.start(
            name,
            move || {
                let coordinator = coordinator.clone();
                let request = request.clone();
                let handler = Arc::clone(&handler);
                async move {
                    let value = coordinator.refresh(request).await?;
                    (*handler)(value);
                    Ok::<(), Error>(())
                }
            },
            interval,
        )
    }

    /// Pause and resume every poll task with the host's visibility
    pub fn bind_visibility(&self, source: &dyn VisibilitySource) {
        self.scheduler.bind_visibility(source);
    }

    /// A batch aggregator using the configured batch window
    pub fn batch_aggregator<P, R>(&self, batch_fn: Arc<dyn BatchFn<P, R>>) -> BatchAggregator<P, R>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        BatchAggregator::new(batch_fn, self.config.batch_delay())
    }

    /// Get cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.coordinator.cache().stats()
    }

    pub fn clear_cache(&self) {
        self.coordinator.clear();
    }

    /// Evict expired cache entries
    pub fn evict_expired_cache(&self) -> usize {
        self.coordinator.cache().evict_expired()
    }

    /// Stop polling, abort in-flight requests and write out the cache snapshot
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        self.coordinator.shutdown();
        self.coordinator.cache().flush_persistence();
    }
}
