use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Settings of [`crate::Cacher`]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacherConfig {
    /// Events retained for replay to late watchers
    ///
    /// **Default**: 100
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Queue between ingestion and a session task. A queue still full
    /// once `dispatch_timeout_ms` has passed force-closes the session.
    ///
    /// **Default**: 10
    #[serde(default = "default_input_queue_size")]
    pub input_queue_size: usize,

    /// Queue between a session task and its `WatchHandle`
    ///
    /// **Default**: 10
    #[serde(default = "default_output_queue_size")]
    pub output_queue_size: usize,

    /// Budget shared by all sessions whose input queue is full when one
    /// event is dispatched. `0` closes full sessions immediately.
    ///
    /// **Default**: 100
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Bookmark period for opted-in sessions
    ///
    /// **Default**: 1000
    #[serde(default = "default_bookmark_interval_ms")]
    pub bookmark_interval_ms: u64,

    /// Upper bound for reads waiting on a future resourceVersion or on the
    /// initial sync, unless the request carries its own timeout
    ///
    /// **Default**: 3000
    #[serde(default = "default_list_wait_timeout_ms")]
    pub list_wait_timeout_ms: u64,
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            input_queue_size: default_input_queue_size(),
            output_queue_size: default_output_queue_size(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            bookmark_interval_ms: default_bookmark_interval_ms(),
            list_wait_timeout_ms: default_list_wait_timeout_ms(),
        }
    }
}

impl CacherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "window_capacity must be > 0".into(),
            )));
        }
        if self.input_queue_size == 0 || self.output_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "watcher queues must be > 0, got input {} output {}",
                self.input_queue_size, self.output_queue_size
            ))));
        }
        if self.bookmark_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "bookmark_interval_ms cannot be 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_window_capacity() -> usize {
    100
}
fn default_input_queue_size() -> usize {
    10
}
fn default_output_queue_size() -> usize {
    10
}
fn default_dispatch_timeout_ms() -> u64 {
    100
}
fn default_bookmark_interval_ms() -> u64 {
    1000
}
fn default_list_wait_timeout_ms() -> u64 {
    3000
}
