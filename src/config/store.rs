use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Settings of [`crate::KvStore`]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Prepended to every key
    ///
    /// Default: "/registry"
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Decoded objects kept per store, keyed by mod revision.
    /// Oldest insertions are evicted first. `0` disables the cache.
    ///
    /// Default: 50000
    #[serde(default = "default_decode_cache_capacity")]
    pub decode_cache_capacity: usize,

    /// Operations slower than this are logged at warn level
    ///
    /// Default: 500
    #[serde(default = "default_slow_operation_threshold_ms")]
    pub slow_operation_threshold_ms: u64,

    /// Buffer between the backend watch task and a `WatchHandle`
    ///
    /// Default: 100
    #[serde(default = "default_watch_buffer_size")]
    pub watch_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            decode_cache_capacity: default_decode_cache_capacity(),
            slow_operation_threshold_ms: default_slow_operation_threshold_ms(),
            watch_buffer_size: default_watch_buffer_size(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "path_prefix must be empty or start with '/', got {:?}",
                self.path_prefix
            ))));
        }
        if self.watch_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_buffer_size must be > 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_path_prefix() -> String {
    "/registry".to_string()
}
fn default_decode_cache_capacity() -> usize {
    50_000
}
fn default_slow_operation_threshold_ms() -> u64 {
    500
}
fn default_watch_buffer_size() -> usize {
    100
}
