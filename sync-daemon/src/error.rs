use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] figment::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Sync(#[from] sync_client::Error),
    #[error("failed to initialize logging: {0}")]
    Logging(#[from] log::SetLoggerError),
    #[error("failed to listen for signals: {0}")]
    Signal(#[from] std::io::Error),
}
