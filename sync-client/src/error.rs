use strum_macros::Display;

/// Broad classification of an [`Error`], used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    TransientFetch,
    Status,
    Batch,
    PollCallback,
    CacheCorruption,
    Persistence,
    Config,
}

/// Errors produced by the synchronization layer.
///
/// The type is `Clone` because a single outcome is replayed to every caller that joined a
/// deduplicated request or a batch window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("request to {endpoint} failed: {message}")]
    Fetch { endpoint: String, message: String },
    #[error("request for {key} stopped before it settled")]
    Interrupted { key: String },
    #[error("request to {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("batch call failed: {0}")]
    Batch(String),
    #[error("batch call returned {actual} results for {expected} requests")]
    BatchLength { expected: usize, actual: usize },
    #[error("batch window was dropped before it was flushed")]
    BatchDropped,
    #[error("poll task {key} failed: {message}")]
    PollCallback { key: String, message: String },
    #[error("persisted cache state is unreadable: {0}")]
    CacheCorruption(String),
    #[error("cache persistence failed: {0}")]
    Persistence(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn fetch(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Error::Fetch {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fetch { .. } | Error::Interrupted { .. } => ErrorKind::TransientFetch,
            Error::Status { .. } => ErrorKind::Status,
            Error::Batch(_) | Error::BatchLength { .. } | Error::BatchDropped => ErrorKind::Batch,
            Error::PollCallback { .. } => ErrorKind::PollCallback,
            Error::CacheCorruption(_) => ErrorKind::CacheCorruption,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::CacheCorruption(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Persistence(error.to_string())
    }
}
