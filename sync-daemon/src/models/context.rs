use getset::Getters;
use log::info;
use serde_json::Value;
use std::sync::Arc;
use sync_client::{FilePersistence, SyncClient, Visibility, VisibilityController};
use url::Url;

use super::config::Config;
use crate::error::DaemonError;
use crate::http::HttpRequestFn;

#[derive(Getters)]
#[get = "pub"]
pub struct Context {
    sync_client: SyncClient<Value>,
    visibility: VisibilityController,
    config: Config,
}

impl Context {
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        let base_url = Url::parse(config.base_url())?;
        let request_fn = Arc::new(HttpRequestFn::new(base_url, config.request_timeout()));

        let sync_client = match config.cache_file() {
            Some(path) => SyncClient::with_persistence(
                config.sync().clone(),
                request_fn,
                Arc::new(FilePersistence::new(path.clone())),
            )?,
            None => SyncClient::new(config.sync().clone(), request_fn)?,
        };

        let visibility = VisibilityController::default();
        sync_client.bind_visibility(&visibility);

        info!(
            "Initialized SyncClient against {} (cache file: {:?})",
            config.base_url(),
            config.cache_file()
        );

        Ok(Self {
            sync_client,
            visibility,
            config,
        })
    }

    /// Register a poll task for every configured endpoint
    pub fn start_polling(&self) -> Result<(), DaemonError> {
        for endpoint in self.config.endpoints() {
            let name = endpoint.name().clone();
            info!(
                "Polling {} ({}) every {:?}",
                name,
                endpoint.path(),
                self.config.sync().poll_interval(&name)
            );

            let label = name.clone();
            self.sync_client
                .poll(name, endpoint.request(), move |snapshot: Value| {
                    info!("{}: {}", label, describe(&snapshot));
                })?;
        }
        Ok(())
    }

    pub fn toggle_visibility(&self) -> Visibility {
        let visibility = self.visibility.toggle();
        match visibility {
            Visibility::Hidden => info!("Pausing dashboard polling"),
            Visibility::Visible => info!("Resuming dashboard polling"),
        }
        visibility
    }

    pub fn shutdown(&self) {
        self.sync_client.shutdown();
        let stats = self.sync_client.cache_stats();
        info!(
            "Shut down with {} cached entries ({} stale)",
            stats.total_entries, stats.stale_entries
        );
    }
}

/// One-line summary of a snapshot for the log
pub fn describe(snapshot: &Value) -> String {
    match snapshot {
        Value::Array(items) => format!("{} items", items.len()),
        Value::Object(fields) => {
            let lists: Vec<String> = fields
                .iter()
                .filter_map(|(name, value)| value.as_array().map(|items| format!("{} {}", items.len(), name)))
                .collect();
            if lists.is_empty() {
                format!("{} fields", fields.len())
            } else {
                lists.join(", ")
            }
        }
        Value::Null => "empty".to_string(),
        other => other.to_string(),
    }
}

pub type ContextPointer = Arc<Context>;
