use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sled,
}

/// Settings of the external store adaptors
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Which adaptor [`crate::backend::open_backend`] builds
    #[serde(default)]
    pub kind: BackendKind,

    /// Database directory for the sled adaptor
    #[serde(default = "default_sled_path")]
    pub sled_path: PathBuf,

    #[serde(default)]
    pub sled_compression: bool,

    /// Events retained for watch resumption; older ones are compacted.
    /// `0` keeps everything.
    ///
    /// Default: 10000
    #[serde(default = "default_history_limit")]
    pub history_limit: u64,

    /// Live event ring shared by all backend watchers. Lagging watchers
    /// fall back to retained history.
    ///
    /// Default: 1024
    #[serde(default = "default_watch_channel_capacity")]
    pub watch_channel_capacity: usize,

    /// Per backend watcher buffer
    ///
    /// Default: 100
    #[serde(default = "default_watcher_buffer_size")]
    pub watcher_buffer_size: usize,

    /// Period of [`crate::backend::spawn_ttl_sweeper`]
    ///
    /// Default: 1000
    #[serde(default = "default_ttl_sweep_interval_ms")]
    pub ttl_sweep_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            sled_path: default_sled_path(),
            sled_compression: false,
            history_limit: default_history_limit(),
            watch_channel_capacity: default_watch_channel_capacity(),
            watcher_buffer_size: default_watcher_buffer_size(),
            ttl_sweep_interval_ms: default_ttl_sweep_interval_ms(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == BackendKind::Sled && self.sled_path.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "sled_path is required for the sled backend".into(),
            )));
        }
        if self.watch_channel_capacity == 0 || self.watcher_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_channel_capacity and watcher_buffer_size must be > 0".into(),
            )));
        }
        if !(10..=3_600_000).contains(&self.ttl_sweep_interval_ms) {
            return Err(Error::Config(ConfigError::Message(format!(
                "ttl_sweep_interval_ms must be between 10 and 3600000, got {}",
                self.ttl_sweep_interval_ms
            ))));
        }
        Ok(())
    }
}

fn default_sled_path() -> PathBuf {
    PathBuf::from("./db/storage")
}
fn default_history_limit() -> u64 {
    10_000
}
fn default_watch_channel_capacity() -> usize {
    1024
}
fn default_watcher_buffer_size() -> usize {
    100
}
fn default_ttl_sweep_interval_ms() -> u64 {
    1000
}
