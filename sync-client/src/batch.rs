use crate::Error;
use async_trait::async_trait;
use futures::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Combined call issued once per batch window.
///
/// Must return exactly one result per input, in input order, or fail as a whole.
#[async_trait]
pub trait BatchFn<P, R>: Send + Sync {
    async fn call(&self, params: Vec<P>) -> Result<Vec<R>, Error>;
}

#[async_trait]
impl<P, R, F, Fut> BatchFn<P, R> for F
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<R>, Error>> + Send,
{
    async fn call(&self, params: Vec<P>) -> Result<Vec<R>, Error> {
        (self)(params).await
    }
}

struct Waiter<P, R> {
    params: P,
    sender: oneshot::Sender<Result<R, Error>>,
}

struct BatchWindow<P, R> {
    queue: Vec<Waiter<P, R>>,
    /// Bumped on every flush; a timer only flushes the window it was scheduled for
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner<P, R> {
    window: Mutex<BatchWindow<P, R>>,
    batch_fn: Arc<dyn BatchFn<P, R>>,
    delay: Duration,
}

/// Coalesces calls issued within `delay` of each other into one [`BatchFn`] call.
pub struct BatchAggregator<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for BatchAggregator<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, R> BatchAggregator<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(batch_fn: Arc<dyn BatchFn<P, R>>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                window: Mutex::new(BatchWindow {
                    queue: Vec::new(),
                    generation: 0,
                    timer: None,
                }),
                batch_fn,
                delay,
            }),
        }
    }

    /// Queue `params` for the current window and wait for its positional result.
    pub async fn request(&self, params: P) -> Result<R, Error> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut window = self.inner.window();
            window.queue.push(Waiter { params, sender });

            if window.timer.is_none() {
                let generation = window.generation;
                let inner = Arc::clone(&self.inner);
                window.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(inner.delay).await;
                    Inner::flush_window(&inner, Some(generation)).await;
                }));
            }
        }

        receiver.await.unwrap_or(Err(Error::BatchDropped))
    }

    /// Flush the current window now, cancelling its timer.
    pub async fn flush(&self) {
        Inner::flush_window(&self.inner, None).await;
    }

    /// Number of calls waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.window().queue.len()
    }
}

impl<P, R> Inner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn window(&self) -> MutexGuard<'_, BatchWindow<P, R>> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush_window(inner: &Arc<Self>, scheduled: Option<u64>) {
        let waiters = {
            let mut window = inner.window();
            match scheduled {
                Some(generation) if generation != window.generation => return,
                Some(_) => {
                    window.timer.take();
                }
                None => {
                    if let Some(timer) = window.timer.take() {
                        timer.abort();
                    }
                }
            }
            window.generation += 1;
            std::mem::take(&mut window.queue)
        };

        if waiters.is_empty() {
            log::debug!("Batch window closed with nothing queued");
            return;
        }

        let (params, senders): (Vec<P>, Vec<_>) = waiters
            .into_iter()
            .map(|waiter| (waiter.params, waiter.sender))
            .unzip();
        let expected = params.len();
        log::debug!("Flushing batch of {} requests", expected);

        let error = match inner.batch_fn.call(params).await {
            Ok(results) if results.len() == expected => {
                for (sender, result) in senders.into_iter().zip(results) {
                    let _ = sender.send(Ok(result));
                }
                return;
            }
            Ok(results) => Error::BatchLength {
                expected,
                actual: results.len(),
            },
            Err(e) => e,
        };

        log::warn!("Batch of {} requests failed: {}", expected, error);
        for sender in senders {
            let _ = sender.send(Err(error.clone()));
        }
    }
}
