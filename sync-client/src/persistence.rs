use crate::cache::CacheKey;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// Version tag written into every snapshot.
pub const STATE_VERSION: u32 = 1;

/// Durable storage for serialized cache state.
pub trait PersistenceAdapter: Send + Sync {
    fn save(&self, state: &str) -> Result<(), Error>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<String>, Error>;
}

pub type SharedPersistence = Arc<dyn PersistenceAdapter>;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedState<V> {
    pub version: u32,
    pub entries: Vec<PersistedEntry<V>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl<V: DeserializeOwned> PersistedState<V> {
    pub fn decode(raw: &str) -> Result<Self, Error> {
        let state: PersistedState<V> = serde_json::from_str(raw)?;
        if state.version != STATE_VERSION {
            return Err(Error::CacheCorruption(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct WriterState {
    /// Newest snapshot not yet handed to the adapter
    queued: Option<String>,
    /// A blocking drain job is scheduled or running
    scheduled: bool,
}

/// Hands snapshots to a [`PersistenceAdapter`] one at a time, newest last.
///
/// Inside a tokio runtime the adapter runs on the blocking pool and snapshots submitted while
/// a save is in progress are coalesced into the newest one. Outside a runtime saves happen
/// inline.
pub(crate) struct SnapshotWriter {
    adapter: SharedPersistence,
    state: Mutex<WriterState>,
    /// Held for the duration of every save
    io: Mutex<()>,
}

impl SnapshotWriter {
    pub fn new(adapter: SharedPersistence) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            state: Mutex::new(WriterState::default()),
            io: Mutex::new(()),
        })
    }

    pub fn adapter(&self) -> &SharedPersistence {
        &self.adapter
    }

    /// Queue `snapshot`, replacing any older snapshot that has not been written yet.
    pub fn submit(self: &Arc<Self>, snapshot: String) {
        let mut state = lock(&self.state);
        state.queued = Some(snapshot);
        if state.scheduled {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                state.scheduled = true;
                drop(state);
                let writer = Arc::clone(self);
                runtime.spawn_blocking(move || writer.drain());
            }
            Err(_) => {
                drop(state);
                self.flush();
            }
        }
    }

    /// Write the queued snapshot, if any, before returning.
    pub fn flush(&self) {
        let _io = lock(&self.io);
        let queued = lock(&self.state).queued.take();
        if let Some(snapshot) = queued {
            self.save(&snapshot);
        }
    }

    fn drain(&self) {
        let _io = lock(&self.io);
        loop {
            let snapshot = {
                let mut state = lock(&self.state);
                match state.queued.take() {
                    Some(snapshot) => snapshot,
                    None => {
                        state.scheduled = false;
                        return;
                    }
                }
            };
            self.save(&snapshot);
        }
    }

    fn save(&self, snapshot: &str) {
        if let Err(e) = self.adapter.save(snapshot) {
            log::warn!("Failed to persist cache state: {}", e);
        }
    }
}

/// Stores the cache snapshot as a JSON file.
///
/// Each save writes a fresh temporary file next to the target and renames it into place, so
/// readers only ever see a complete snapshot.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceAdapter for FilePersistence {
    fn save(&self, state: &str) -> Result<(), Error> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                parent.to_path_buf()
            }
            None => PathBuf::from("."),
        };

        let _guard = lock(&self.write_lock);
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(state.as_bytes())?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, Error> {
        match fs::read_to_string(&self.path) {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the snapshot in memory; handy for tests and for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn with_state(state: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(Some(state.into())),
        }
    }

    pub fn state(&self) -> Option<String> {
        lock(&self.state).clone()
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn save(&self, state: &str) -> Result<(), Error> {
        *lock(&self.state) = Some(state.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, Error> {
        Ok(self.state())
    }
}
