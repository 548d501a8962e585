use crate::Error;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_enabled() -> bool {
    true
}

fn default_max_size() -> usize {
    1000
}

fn default_max_age_ms() -> u64 {
    5 * 60 * 1000
}

fn default_batch_delay_ms() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

/// Construction-time options shared by the cache, the coordinator, the batch aggregator and the
/// polling scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct SyncConfig {
    /// Whether responses are cached at all
    #[serde(default = "default_enabled")]
    #[getset(get_copy = "pub")]
    enabled: bool,
    /// Maximum number of cached entries before eviction kicks in
    #[serde(default = "default_max_size")]
    #[getset(get_copy = "pub")]
    max_size: usize,
    /// Default time-to-live of a cache entry
    #[serde(default = "default_max_age_ms")]
    #[getset(get_copy = "pub")]
    max_age_ms: u64,
    /// Serve expired entries while refreshing them in the background
    #[serde(default = "default_enabled")]
    #[getset(get_copy = "pub")]
    stale_while_revalidate: bool,
    /// How long a batch window stays open
    #[serde(default = "default_batch_delay_ms")]
    #[getset(get_copy = "pub")]
    batch_delay_ms: u64,
    /// Poll interval per task name
    #[serde(default)]
    #[getset(get = "pub")]
    poll_intervals: HashMap<String, u64>,
    /// Poll interval for task names missing from `poll_intervals`
    #[serde(default = "default_poll_interval_ms")]
    #[getset(get_copy = "pub")]
    default_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size: default_max_size(),
            max_age_ms: default_max_age_ms(),
            stale_while_revalidate: true,
            batch_delay_ms: default_batch_delay_ms(),
            poll_intervals: HashMap::new(),
            default_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SyncConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = max_age.as_millis() as u64;
        self
    }

    pub fn with_stale_while_revalidate(mut self, stale_while_revalidate: bool) -> Self {
        self.stale_while_revalidate = stale_while_revalidate;
        self
    }

    pub fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay_ms = batch_delay.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, name: impl Into<String>, interval: Duration) -> Self {
        self.poll_intervals
            .insert(name.into(), interval.as_millis() as u64);
        self
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_age_ms as i64)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// The interval configured for `name`, falling back to the default interval.
    pub fn poll_interval(&self, name: &str) -> Duration {
        Duration::from_millis(
            self.poll_intervals
                .get(name)
                .copied()
                .unwrap_or(self.default_poll_interval_ms),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".to_string()));
        }
        if self.default_poll_interval_ms == 0 {
            return Err(Error::Config(
                "default_poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some((name, _)) = self.poll_intervals.iter().find(|(_, ms)| **ms == 0) {
            return Err(Error::Config(format!(
                "poll interval for {} must be positive",
                name
            )));
        }
        Ok(())
    }
}
