use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use getset::Getters;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_client::{Request, SyncConfig};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3001/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// A dashboard endpoint the daemon keeps in sync
#[derive(Clone, Debug, Deserialize, Getters)]
#[get = "pub"]
pub struct EndpointConfig {
    name: String,
    path: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

impl EndpointConfig {
    pub fn request(&self) -> Request {
        self.params
            .iter()
            .fold(Request::get(self.path.clone()), |request, (name, value)| {
                request.param(name.clone(), value.clone())
            })
    }
}

#[derive(Clone, Debug, Deserialize, Getters)]
#[get = "pub"]
pub struct Config {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cache_file: Option<PathBuf>,
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    sync: SyncConfig,
}

impl Config {
    /// Read `path` (a missing file means "all defaults"), then apply `SYNC_` environment
    /// overrides, e.g. `SYNC_LOG_LEVEL=debug` or `SYNC_SYNC__MAX_SIZE=200`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("SYNC_").split("__"))
            .extract()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
