use crate::cache::CacheKey;
use crate::Error;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable, BoxFuture, Shared};
use futures::{Future, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Configuration for request deduplication
#[derive(Clone, Debug)]
pub struct DeduplicationConfig {
    /// Whether deduplication is enabled
    pub enabled: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, Error>>>;

/// Represents a pending request
struct PendingRequest<T> {
    id: u64,
    outcome: SharedOutcome<T>,
    abort: AbortHandle,
}

type PendingTable<T> = DashMap<CacheKey, PendingRequest<T>>;

/// Owned by the running operation; removes its own registration when the operation ends,
/// whether it settled, panicked or was aborted.
struct Registration<T> {
    pending_requests: Arc<PendingTable<T>>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.pending_requests
            .remove_if(&self.key, |_, pending| pending.id == self.id);
    }
}

/// Request deduplication system
/// When multiple identical requests overlap, only the first one is executed
/// and its outcome is shared with every caller that joined while it was running.
///
/// The operation runs as its own tokio task, so callers that give up (a timeout, an aborted
/// poll tick) never strand it: it still settles, and its registration is still removed.
pub struct RequestDeduplicator<T> {
    /// Map of cache keys to pending requests
    pending_requests: Arc<PendingTable<T>>,
    next_id: Arc<AtomicU64>,
    config: DeduplicationConfig,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            pending_requests: Arc::clone(&self.pending_requests),
            next_id: Arc::clone(&self.next_id),
            config: self.config.clone(),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DeduplicationConfig) -> Self {
        Self {
            pending_requests: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Run the operation built by `factory`, or join the one already pending for `key`.
    ///
    /// `factory` is only called for the first request of an overlap burst. It runs under the
    /// lock of the key's map shard, so it must build the future and nothing else; in particular
    /// it must not call back into this deduplicator. If it panics nothing is registered.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn request<F, Fut>(&self, key: CacheKey, factory: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        if !self.config.enabled {
            return factory().await;
        }

        let (outcome, operation) = match self.pending_requests.entry(key.clone()) {
            Entry::Occupied(entry) => {
                log::debug!("Request already pending for key: {}", key);
                (entry.get().outcome.clone(), None)
            }
            Entry::Vacant(entry) => {
                log::debug!("Executing new request for key: {}", key);
                let operation = factory();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel();
                let (abort, abort_registration) = AbortHandle::new_pair();

                let interrupted = key.to_string();
                let outcome = receiver
                    .map(move |received| {
                        received.unwrap_or_else(|_| Err(Error::Interrupted { key: interrupted }))
                    })
                    .boxed()
                    .shared();
                entry.insert(PendingRequest {
                    id,
                    outcome: outcome.clone(),
                    abort,
                });

                let registration = Registration {
                    pending_requests: Arc::clone(&self.pending_requests),
                    key,
                    id,
                };
                let operation = async move {
                    if let Ok(result) = Abortable::new(operation, abort_registration).await {
                        drop(registration);
                        let _ = sender.send(result);
                    }
                };
                (outcome, Some(operation))
            }
        };

        if let Some(operation) = operation {
            tokio::spawn(operation);
        }
        outcome.await
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending_requests.contains_key(key)
    }

    /// Get statistics about pending requests
    pub fn stats(&self) -> DeduplicationStats {
        DeduplicationStats {
            pending_requests: self.pending_requests.len(),
        }
    }

    /// Forget all pending requests. Running operations still settle for the callers already
    /// waiting on them, but new requests start fresh ones.
    pub fn clear(&self) {
        self.pending_requests.clear();
        log::info!("Request deduplicator cleared");
    }

    /// Cancel every running operation. Its waiters receive [`Error::Interrupted`].
    pub fn abort_all(&self) {
        let mut aborted = 0;
        self.pending_requests.retain(|_, pending| {
            pending.abort.abort();
            aborted += 1;
            false
        });
        if aborted > 0 {
            log::info!("Aborted {} pending requests", aborted);
        }
    }
}

/// Statistics for request deduplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationStats {
    pub pending_requests: usize,
}

/// Thread-safe wrapper for the deduplicator
pub type SharedRequestDeduplicator<T> = Arc<RequestDeduplicator<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn test_request_deduplication() {
        let deduplicator = RequestDeduplicator::<usize>::new(DeduplicationConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("agents");

        // Execute multiple identical requests concurrently
        let mut handles = vec![];
        for _ in 0..5 {
            let deduplicator = deduplicator.clone();
            let key = key.clone();
            let execution_count = execution_count.clone();

            let handle = tokio::spawn(async move {
                deduplicator
                    .request(key, || async move {
                        let call = execution_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(100)).await;
                        Ok::<_, Error>(call + 42)
                    })
                    .await
            });

            handles.push(handle);
        }

        // Every caller observes the same settled value
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }

        // Should have executed only once due to deduplication
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        assert!(!deduplicator.is_pending(&key));
        assert_eq!(deduplicator.stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_different_keys_not_deduplicated() {
        let deduplicator = RequestDeduplicator::<()>::new(DeduplicationConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));

        let execution_count1 = execution_count.clone();
        let execution_count2 = execution_count.clone();

        let first = deduplicator.request(CacheKey::new("agents"), || async move {
            execution_count1.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        });
        let second = deduplicator.request(CacheKey::new("tasks"), || async move {
            execution_count2.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        });
        let (first, second) = futures::join!(first, second);

        // Should have executed twice since keys are different
        assert_eq!((first, second), (Ok(()), Ok(())));
        assert_eq!(execution_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_clears_registration() {
        let deduplicator = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let key = CacheKey::new("agents");

        let result = deduplicator
            .request(key.clone(), || async {
                Err::<u32, _>(Error::fetch("/api/agents", "connection refused"))
            })
            .await;
        assert!(result.is_err());
        assert!(!deduplicator.is_pending(&key));

        // The next burst starts a fresh operation
        let result = deduplicator.request(key, || async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_panicking_factory_leaves_no_registration() {
        let deduplicator = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let key = CacheKey::new("agents");

        let outcome = AssertUnwindSafe(deduplicator.request(
            key.clone(),
            || -> futures::future::Ready<Result<u32, Error>> { panic!("cannot build request") },
        ))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert!(!deduplicator.is_pending(&key));
        assert_eq!(deduplicator.stats().pending_requests, 0);

        let result = deduplicator.request(key, || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_outlives_a_caller_that_gives_up() {
        let deduplicator = RequestDeduplicator::<usize>::new(DeduplicationConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("agents");

        let counter = execution_count.clone();
        let gave_up = tokio::time::timeout(
            StdDuration::from_millis(10),
            deduplicator.request(key.clone(), || async move {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                Ok::<_, Error>(counter.fetch_add(1, Ordering::SeqCst) + 1)
            }),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(deduplicator.is_pending(&key));

        tokio::time::sleep(StdDuration::from_millis(100)).await;

        // The operation finished on its own and released the key
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        assert!(!deduplicator.is_pending(&key));

        let counter = execution_count.clone();
        let result = deduplicator
            .request(key, || async move {
                Ok::<_, Error>(counter.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_operation_does_not_unregister_its_successor() {
        let deduplicator = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let key = CacheKey::new("agents");

        let first = {
            let deduplicator = deduplicator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                deduplicator
                    .request(key, || async {
                        tokio::time::sleep(StdDuration::from_millis(100)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        deduplicator.clear();

        let second = {
            let deduplicator = deduplicator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                deduplicator
                    .request(key, || async {
                        tokio::time::sleep(StdDuration::from_millis(300)).await;
                        Ok(2)
                    })
                    .await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(150)).await;

        assert_eq!(first.await.unwrap(), Ok(1));
        assert!(deduplicator.is_pending(&key));

        assert_eq!(second.await.unwrap(), Ok(2));
        assert!(!deduplicator.is_pending(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_interrupts_waiters() {
        let deduplicator = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let key = CacheKey::new("agents");

        let waiter = {
            let deduplicator = deduplicator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                deduplicator
                    .request(key, || async {
                        tokio::time::sleep(StdDuration::from_secs(10)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        deduplicator.abort_all();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Interrupted { .. })));
        assert!(!deduplicator.is_pending(&key));
    }

    #[tokio::test]
    async fn test_sequential_requests_are_not_merged() {
        let deduplicator = RequestDeduplicator::<usize>::new(DeduplicationConfig::default());
        let execution_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let execution_count = execution_count.clone();
            deduplicator
                .request(CacheKey::new("agents"), || async move {
                    Ok::<_, Error>(execution_count.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }

        assert_eq!(execution_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_deduplication_runs_every_request() {
        let deduplicator = RequestDeduplicator::<()>::new(DeduplicationConfig { enabled: false });
        let execution_count = Arc::new(AtomicUsize::new(0));

        let requests = (0..3).map(|_| {
            let execution_count = execution_count.clone();
            deduplicator.request(CacheKey::new("agents"), move || async move {
                execution_count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(StdDuration::from_millis(10)).await;
                Ok::<(), Error>(())
            })
        });
        futures::future::join_all(requests).await;

        assert_eq!(execution_count.load(Ordering::SeqCst), 3);
    }
}
