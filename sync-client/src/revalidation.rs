use crate::cache::{CacheKey, CacheValue, EntryOptions, SharedRequestCache};
use crate::deduplication::{DeduplicationConfig, RequestDeduplicator};
use crate::request::{Request, RequestFn, IF_NONE_MATCH};
use crate::Error;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;

/// The injected request function, shared between the coordinator and its background tasks
pub type SharedRequestFn<V> = Arc<dyn RequestFn<V>>;

struct Inner<V> {
    cache: SharedRequestCache<V>,
    deduplicator: RequestDeduplicator<V>,
    request_fn: SharedRequestFn<V>,
    revalidations: Mutex<JoinSet<()>>,
}

/// Stale-while-revalidate on top of a [`RequestCache`](crate::RequestCache).
///
/// Fresh hits never touch the network, stale hits are served immediately while a single
/// deduplicated background refresh runs, and misses wait for the (deduplicated) request.
pub struct RevalidationCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RevalidationCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> RevalidationCoordinator<V> {
    pub fn new(cache: SharedRequestCache<V>, request_fn: SharedRequestFn<V>) -> Self {
        Self::with_deduplication(cache, request_fn, DeduplicationConfig::default())
    }

    pub fn with_deduplication(
        cache: SharedRequestCache<V>,
        request_fn: SharedRequestFn<V>,
        deduplication: DeduplicationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                deduplicator: RequestDeduplicator::new(deduplication),
                request_fn,
                revalidations: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn cache(&self) -> &SharedRequestCache<V> {
        &self.inner.cache
    }

    /// Resolve `request` through the cache.
    ///
    /// Errors only surface on a miss; whenever a previous value exists it is returned instead.
    pub async fn fetch(&self, request: Request) -> Result<V, Error> {
        let key = CacheKey::from_request(&request);

        if let Some(cached) = self.inner.cache.get(&key) {
            if cached.is_stale {
                log::debug!("Serving stale value for {}", request.endpoint());
                self.revalidate_in_background(key, request, cached.etag);
            }
            return Ok(cached.value);
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .deduplicator
            .request(key.clone(), move || Inner::load(inner, key, request, None))
            .await
    }

    /// Re-request `request` even when the cached value is fresh, conditionally when an entity
    /// tag is stored. Joins a refresh that is already running for the same key.
    ///
    /// A failed refresh falls back to the cached value when there is one.
    pub async fn refresh(&self, request: Request) -> Result<V, Error> {
        let key = CacheKey::from_request(&request);
        let cached = self.inner.cache.get(&key);
        let etag = cached.as_ref().and_then(|cached| cached.etag.clone());
        let endpoint = request.endpoint().clone();

        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .deduplicator
            .request(key.clone(), move || Inner::load(inner, key, request, etag))
            .await;

        match (result, cached) {
            (Ok(value), _) => Ok(value),
            (Err(e), Some(cached)) => {
                log::warn!("Refresh of {} failed, keeping cached value: {}", endpoint, e);
                Ok(cached.value)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Drop the cached response for `request`
    pub fn invalidate(&self, request: &Request) -> bool {
        self.inner.cache.invalidate(&CacheKey::from_request(request))
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Number of background refreshes still running
    pub fn pending_revalidations(&self) -> usize {
        let mut revalidations = self.revalidations();
        while revalidations.try_join_next().is_some() {}
        revalidations.len()
    }

    /// Wait until every background refresh started so far has finished.
    pub async fn settle_revalidations(&self) {
        let mut revalidations = std::mem::take(&mut *self.revalidations());
        while revalidations.join_next().await.is_some() {}
    }

    /// Abort all background refreshes and in-flight requests. Callers still waiting on a
    /// request receive [`Error::Interrupted`]; cached values are left as they are.
    pub fn shutdown(&self) {
        let mut revalidations = self.revalidations();
        if !revalidations.is_empty() {
            log::info!("Aborting {} background revalidations", revalidations.len());
        }
        revalidations.abort_all();
        drop(revalidations);
        self.inner.deduplicator.abort_all();
    }

    fn revalidate_in_background(&self, key: CacheKey, request: Request, etag: Option<String>) {
        // A registration only lives as long as its request runs, so this is never a leftover
        if self.inner.deduplicator.is_pending(&key) {
            log::debug!("Revalidation already running for key: {}", key);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut revalidations = self.revalidations();
        while revalidations.try_join_next().is_some() {}
        revalidations.spawn(async move {
            let endpoint = request.endpoint().clone();
            let load = {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                move || Inner::load(inner, key, request, etag)
            };

            match inner.deduplicator.request(key, load).await {
                Ok(_) => log::debug!("Revalidated {}", endpoint),
                Err(e) => log::warn!("Background revalidation of {} failed: {}", endpoint, e),
            }
        });
    }

    fn revalidations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .revalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: CacheValue> Inner<V> {
    /// Perform the request and write its outcome to the cache. Runs at most once per key at a
    /// time, as the owner of the deduplicator's pending entry.
    ///
    /// A "not modified" answer restarts the entry's lifetime with the configured max age.
    async fn load(
        inner: Arc<Self>,
        key: CacheKey,
        request: Request,
        etag: Option<String>,
    ) -> Result<V, Error> {
        let endpoint = request.endpoint().clone();
        let conditional = etag.is_some();
        let request = match etag {
            Some(etag) => request.header(IF_NONE_MATCH, etag),
            None => request,
        };

        let response = inner.request_fn.request(request).await?;

        if response.is_not_modified() {
            if conditional && inner.cache.touch(&key, Some(inner.cache.config.max_age)) {
                if let Some(cached) = inner.cache.get(&key) {
                    log::debug!("{} not modified, keeping cached value", endpoint);
                    return Ok(cached.value);
                }
            }
            return Err(Error::fetch(
                endpoint,
                "not modified, but there is no cached value to keep",
            ));
        }

        if !response.is_success() {
            return Err(Error::Status {
                endpoint,
                status: response.status,
            });
        }

        let etag = response.etag().map(str::to_string);
        let Some(value) = response.body else {
            return Err(Error::fetch(endpoint, "response has no body"));
        };

        inner.cache.set(
            key,
            value.clone(),
            EntryOptions {
                ttl: None,
                etag,
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, RequestCache};
    use crate::clock::ManualClock;
    use crate::request::RawResponse;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::VecDeque;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct MockServer {
        calls: Mutex<Vec<Request>>,
        responses: Mutex<VecDeque<Result<RawResponse<i32>, Error>>>,
        delay: StdDuration,
    }

    impl MockServer {
        fn with_delay(delay: StdDuration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn respond(&self, response: Result<RawResponse<i32>, Error>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> Vec<Request> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestFn<i32> for MockServer {
        async fn request(&self, request: Request) -> Result<RawResponse<i32>, Error> {
            self.calls.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::fetch("mock", "no response queued")));
            response
        }
    }

    fn setup(
        stale_while_revalidate: bool,
        server: Arc<MockServer>,
    ) -> (RevalidationCoordinator<i32>, ManualClock) {
        let clock = ManualClock::default();
        let config = CacheConfig {
            max_age: Duration::seconds(60),
            max_size: 100,
            stale_while_revalidate,
            enabled: true,
        };
        let cache = Arc::new(RequestCache::with_clock(config, Arc::new(clock.clone())));
        (RevalidationCoordinator::new(cache, server), clock)
    }

    fn agents() -> Request {
        Request::get("/api/agents").param("team", "red")
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_issue_one_request() {
        let server = Arc::new(MockServer::with_delay(StdDuration::from_millis(50)));
        server.respond(Ok(RawResponse::ok(7)));
        let (coordinator, _clock) = setup(true, server.clone());

        let results =
            futures::future::join_all((0..5).map(|_| coordinator.fetch(agents()))).await;

        assert!(results.into_iter().all(|result| result == Ok(7)));
        assert_eq!(server.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_network() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(7)));
        let (coordinator, _clock) = setup(true, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(7));
        assert_eq!(coordinator.fetch(agents()).await, Ok(7));

        assert_eq!(server.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_miss_failure_propagates_and_caches_nothing() {
        let server = Arc::new(MockServer::default());
        server.respond(Err(Error::fetch("/api/agents", "connection reset")));
        server.respond(Ok(RawResponse {
            status: 503,
            headers: Default::default(),
            body: None,
        }));
        server.respond(Ok(RawResponse::ok(7)));
        let (coordinator, _clock) = setup(true, server.clone());

        let error = coordinator.fetch(agents()).await.unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::TransientFetch);
        assert!(coordinator.cache().is_empty());

        let error = coordinator.fetch(agents()).await.unwrap_err();
        assert_eq!(
            error,
            Error::Status {
                endpoint: "/api/agents".to_string(),
                status: 503
            }
        );

        assert_eq!(coordinator.fetch(agents()).await, Ok(7));
        assert_eq!(server.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_hit_serves_old_value_and_refreshes() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Ok(RawResponse::ok(2)));
        let (coordinator, clock) = setup(true, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        clock.advance(Duration::seconds(61));

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        coordinator.settle_revalidations().await;

        let key = CacheKey::from_request(&agents());
        let cached = coordinator.cache().get(&key).unwrap();
        assert_eq!(cached.value, 2);
        assert!(!cached.is_stale);
        assert_eq!(coordinator.fetch(agents()).await, Ok(2));
        assert_eq!(server.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_revalidation_sends_etag_and_keeps_payload_on_not_modified() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1).with_etag("abc")));
        server.respond(Ok(RawResponse::not_modified()));
        let (coordinator, clock) = setup(true, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        clock.advance(Duration::seconds(61));
        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        coordinator.settle_revalidations().await;

        let calls = server.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].header_value(IF_NONE_MATCH), None);
        assert_eq!(calls[1].header_value(IF_NONE_MATCH), Some("abc"));

        let cached = coordinator
            .cache()
            .get(&CacheKey::from_request(&agents()))
            .unwrap();
        assert_eq!(cached.value, 1);
        assert!(!cached.is_stale);
        assert_eq!(cached.etag.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_background_failure_keeps_old_value() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Err(Error::fetch("/api/agents", "timed out")));
        let (coordinator, clock) = setup(true, server.clone());

        coordinator.fetch(agents()).await.unwrap();
        clock.advance(Duration::seconds(61));

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        coordinator.settle_revalidations().await;

        let cached = coordinator
            .cache()
            .get(&CacheKey::from_request(&agents()))
            .unwrap();
        assert_eq!(cached.value, 1);
        assert!(cached.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stale_hits_trigger_one_revalidation() {
        let server = Arc::new(MockServer::with_delay(StdDuration::from_millis(50)));
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Ok(RawResponse::ok(2)));
        let (coordinator, clock) = setup(true, server.clone());

        coordinator.fetch(agents()).await.unwrap();
        clock.advance(Duration::seconds(61));

        for _ in 0..5 {
            assert_eq!(coordinator.fetch(agents()).await, Ok(1));
            tokio::task::yield_now().await;
        }
        coordinator.settle_revalidations().await;

        assert_eq!(server.calls().len(), 2);
        assert_eq!(coordinator.pending_revalidations(), 0);
        assert_eq!(coordinator.fetch(agents()).await, Ok(2));
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched_without_stale_while_revalidate() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Ok(RawResponse::ok(2)));
        let (coordinator, clock) = setup(false, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        clock.advance(Duration::seconds(61));

        assert_eq!(coordinator.fetch(agents()).await, Ok(2));
        assert_eq!(coordinator.pending_revalidations(), 0);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_fresh_entry_and_falls_back_on_error() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1).with_etag("v1")));
        server.respond(Ok(RawResponse::ok(2).with_etag("v2")));
        server.respond(Err(Error::fetch("/api/agents", "timed out")));
        let (coordinator, _clock) = setup(true, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        assert_eq!(coordinator.refresh(agents()).await, Ok(2));
        assert_eq!(coordinator.refresh(agents()).await, Ok(2));

        let calls = server.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].header_value(IF_NONE_MATCH), Some("v1"));
        assert_eq!(calls[2].header_value(IF_NONE_MATCH), Some("v2"));

        // Without anything cached the error reaches the caller
        coordinator.clear();
        assert!(coordinator.refresh(agents()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Ok(RawResponse::ok(2)));
        let (coordinator, _clock) = setup(true, server.clone());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        assert!(coordinator.invalidate(&agents()));
        assert_eq!(coordinator.fetch(agents()).await, Ok(2));
    }

    #[tokio::test]
    async fn test_not_modified_restarts_ttl_with_max_age() {
        let server = Arc::new(MockServer::default());
        server.respond(Ok(RawResponse::ok(1).with_etag("abc")));
        server.respond(Ok(RawResponse::not_modified()));
        let (coordinator, clock) = setup(true, server.clone());
        let key = CacheKey::from_request(&agents());

        coordinator.fetch(agents()).await.unwrap();
        coordinator.cache().set(
            key.clone(),
            1,
            EntryOptions::default().ttl(Duration::seconds(1)).etag("abc"),
        );
        clock.advance(Duration::seconds(2));

        assert_eq!(coordinator.refresh(agents()).await, Ok(1));

        // Still fresh well past the short lifetime it was stored with
        clock.advance(Duration::seconds(30));
        let cached = coordinator.cache().get(&key).unwrap();
        assert_eq!(cached.value, 1);
        assert!(!cached.is_stale);

        clock.advance(Duration::seconds(31));
        assert!(coordinator.cache().get(&key).unwrap().is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_still_updates_the_cache() {
        let server = Arc::new(MockServer::with_delay(StdDuration::from_millis(50)));
        server.respond(Ok(RawResponse::ok(1)));
        server.respond(Ok(RawResponse::ok(2)));
        server.respond(Ok(RawResponse::ok(3)));
        let (coordinator, clock) = setup(true, server.clone());
        let key = CacheKey::from_request(&agents());

        assert_eq!(coordinator.fetch(agents()).await, Ok(1));
        clock.advance(Duration::seconds(61));

        let abandoned =
            tokio::time::timeout(StdDuration::from_millis(10), coordinator.refresh(agents())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let cached = coordinator.cache().get(&key).unwrap();
        assert_eq!(cached.value, 2);
        assert!(!cached.is_stale);

        // Later stale hits are revalidated again
        clock.advance(Duration::seconds(61));
        assert_eq!(coordinator.fetch(agents()).await, Ok(2));
        coordinator.settle_revalidations().await;
        assert_eq!(coordinator.fetch(agents()).await, Ok(3));
        assert_eq!(server.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_in_flight_requests() {
        let server = Arc::new(MockServer::with_delay(StdDuration::from_secs(5)));
        server.respond(Ok(RawResponse::ok(1)));
        let (coordinator, _clock) = setup(true, server.clone());

        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fetch(agents()).await })
        };
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        coordinator.shutdown();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(Error::Interrupted { .. })));
        assert!(coordinator.cache().is_empty());
    }
}
