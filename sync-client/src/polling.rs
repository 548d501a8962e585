use crate::visibility::{Visibility, VisibilitySource};
use crate::Error;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Future, FutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Work performed on every tick of a poll task.
#[async_trait]
pub trait PollCallback: Send + Sync {
    async fn poll(&self) -> Result<(), Error>;
}

#[async_trait]
impl<F, Fut> PollCallback for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    async fn poll(&self) -> Result<(), Error> {
        (self)().await
    }
}

struct PollTask {
    interval: Duration,
    callback: Arc<dyn PollCallback>,
    /// Running timer, `None` while paused
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    fn run(&mut self, key: &str) {
        self.halt();
        self.handle = Some(spawn_ticker(
            key.to_string(),
            self.interval,
            Arc::clone(&self.callback),
        ));
    }

    fn halt(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.halt();
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: DashMap<String, PollTask>,
    /// Set while the host is hidden; tasks registered meanwhile start paused
    suspended: AtomicBool,
}

impl TaskTable {
    /// Start ticking unless the host is hidden. Called with the task's entry locked, so a
    /// concurrent `pause_all` either sees the running task or was already visible here.
    fn activate(&self, key: &str, task: &mut PollTask) {
        if self.suspended.load(Ordering::SeqCst) {
            log::debug!("Registered poll task {} while paused", key);
        } else {
            task.run(key);
            log::debug!("Started poll task {} every {:?}", key, task.interval);
        }
    }

    fn pause_all(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        let mut paused = 0;
        for mut task in self.tasks.iter_mut() {
            if task.handle.is_some() {
                task.halt();
                paused += 1;
            }
        }
        log::debug!("Paused {} poll tasks", paused);
    }

    fn resume_all(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        let mut resumed = 0;
        for mut task in self.tasks.iter_mut() {
            if task.handle.is_none() {
                let key = task.key().clone();
                task.run(&key);
                resumed += 1;
            }
        }
        log::debug!("Resumed {} poll tasks", resumed);
    }

    fn stop_all(&self) -> usize {
        let mut stopped = 0;
        // Dropping a task halts it
        self.tasks.retain(|_, _| {
            stopped += 1;
            false
        });
        stopped
    }
}

fn spawn_ticker(key: String, interval: Duration, callback: Arc<dyn PollCallback>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            // The first tick completes immediately
            ticker.tick().await;
            match AssertUnwindSafe(callback.poll()).catch_unwind().await {
                Ok(Ok(())) => log::trace!("Poll task {} ticked", key),
                Ok(Err(e)) => log::warn!("Poll task {} failed: {}", key, e),
                Err(_) => log::error!("Poll task {} panicked", key),
            }
        }
    })
}

/// Named recurring tasks with visibility-aware pause/resume.
///
/// A failing or panicking callback is logged and keeps its schedule; it never affects other
/// tasks. Must be used from within a tokio runtime. Dropping the scheduler cancels every task.
#[derive(Default)]
pub struct PollingScheduler {
    table: Arc<TaskTable>,
    visibility_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `key`, replacing any task already registered there.
    ///
    /// The callback runs immediately and then every `interval`, unless the scheduler is
    /// currently paused by [`pause_all`](Self::pause_all), in which case it waits for
    /// [`resume_all`](Self::resume_all).
    pub fn start<C>(&self, key: impl Into<String>, callback: C, interval: Duration) -> Result<(), Error>
    where
        C: PollCallback + 'static,
    {
        let key = key.into();
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "poll interval for {} must be positive",
                key
            )));
        }

        let mut task = PollTask {
            interval,
            callback: Arc::new(callback),
            handle: None,
        };
        match self.table.tasks.entry(key) {
            Entry::Occupied(mut entry) => {
                log::debug!("Replacing poll task {}", entry.key());
                entry.get_mut().halt();
                self.table.activate(entry.key(), &mut task);
                entry.insert(task);
            }
            Entry::Vacant(entry) => {
                self.table.activate(entry.key(), &mut task);
                entry.insert(task);
            }
        }
        Ok(())
    }

    /// Cancel the task and forget it
    pub fn stop(&self, key: &str) -> bool {
        match self.table.tasks.remove(key) {
            Some((_, mut task)) => {
                task.halt();
                log::debug!("Stopped poll task {}", key);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let stopped = self.table.stop_all();
        log::info!("Stopped {} poll tasks", stopped);
    }

    /// Suspend a single task, keeping its registration
    pub fn pause(&self, key: &str) -> bool {
        match self.table.tasks.get_mut(key) {
            Some(mut task) => {
                task.halt();
                true
            }
            None => false,
        }
    }

    /// Restart a paused task: it runs immediately and then on its interval again
    pub fn resume(&self, key: &str) -> bool {
        match self.table.tasks.get_mut(key) {
            Some(mut task) if task.handle.is_none() => {
                task.run(key);
                true
            }
            _ => false,
        }
    }

    /// Suspend every task. Ticks missed while paused are not replayed.
    pub fn pause_all(&self) {
        self.table.pause_all();
    }

    /// Restart every paused task from now
    pub fn resume_all(&self) {
        self.table.resume_all();
    }

    /// Drive [`pause_all`](Self::pause_all) and [`resume_all`](Self::resume_all) from a
    /// visibility signal. Replaces any previously bound source.
    pub fn bind_visibility(&self, source: &dyn VisibilitySource) {
        let mut receiver = source.subscribe();
        if *receiver.borrow_and_update() == Visibility::Hidden {
            self.table.pause_all();
        }

        let table = Arc::clone(&self.table);
        let watcher = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let visibility = *receiver.borrow_and_update();
                match visibility {
                    Visibility::Hidden => table.pause_all(),
                    Visibility::Visible => table.resume_all(),
                }
            }
        });

        let previous = self
            .visibility_watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(watcher);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.tasks.contains_key(key)
    }

    /// Registered and currently ticking
    pub fn is_active(&self, key: &str) -> bool {
        self.table
            .tasks
            .get(key)
            .is_some_and(|task| task.handle.is_some())
    }

    /// Registered but suspended
    pub fn is_paused(&self, key: &str) -> bool {
        self.table
            .tasks
            .get(key)
            .is_some_and(|task| task.handle.is_none())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.tasks.iter().map(|task| task.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.table.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.tasks.is_empty()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .visibility_watcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            watcher.abort();
        }
        self.table.stop_all();
    }
}
