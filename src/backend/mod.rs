//! External key-value store contract.
//!
//! A backend offers single-key compare-and-swap, ordered prefix scans and
//! a resumable revisioned watch. Every accepted write bumps one global
//! revision and produces exactly one [`BackendEvent`].
//!
//! Two adaptors share one MVCC engine ([`engine::MvccEngine`]):
//!
//! - [`MemoryBackend`]: everything in memory, history bounded by config
//! - [`SledBackend`]: `data`, `events` and `meta` trees in one sled database;
//!   history and TTL deadlines survive a restart

mod engine;
mod mem;
mod sled_adapter;
mod ttl;
mod watch_hub;


use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
pub use engine::*;
pub use mem::*;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
pub use sled_adapter::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
pub use ttl::*;

use crate::config::BackendConfig;
use crate::config::BackendKind;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failures reported by an external store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {key} (mod revision {mod_revision})")]
    KeyExists { key: String, mod_revision: u64 },

    #[error("compare-and-swap failed for {key}: current mod revision {current}")]
    CasFailed { key: String, current: u64 },

    #[error("revision {requested} has been compacted (compacted revision {compacted})")]
    Compacted { requested: u64, compacted: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupted backend data: {0}")]
    Corrupted(String),
}

/// A stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: u64,
    pub mod_revision: u64,
    /// Wall clock deadline in unix milliseconds
    pub expires_at_ms: Option<u64>,
}

impl KeyValue {
    /// Whole seconds left before expiry, `0` without TTL
    pub fn ttl_remaining(&self) -> i64 {
        match self.expires_at_ms {
            None => 0,
            Some(deadline) => {
                let left_ms = deadline.saturating_sub(now_ms());
                // Round up so a live key never reports 0.
                left_ms.div_ceil(1000).max(1) as i64
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// One accepted mutation.
///
/// For deletes `kv` holds the key with an empty value and `prev_kv` the
/// removed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub kind: EventKind,
    pub revision: u64,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl BackendEvent {
    pub fn key(&self) -> &str {
        &self.kv.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Key(String),
    /// Every key starting with the prefix
    Prefix(String),
}

impl WatchTarget {
    pub fn matches(
        &self,
        key: &str,
    ) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub kv: Option<KeyValue>,
    /// Store revision at read time
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: u64,
    /// More keys exist after the last returned one
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResponse {
    pub prev_kv: KeyValue,
    /// Revision of the delete itself
    pub revision: u64,
}

/// Receiving side of a backend watch. Dropping it stops the producer task.
///
/// A compacted start point is reported in-stream as
/// `Err(BackendError::Compacted)` followed by the end of the stream.
#[derive(Debug)]
pub struct BackendWatch {
    events: mpsc::Receiver<BackendResult<BackendEvent>>,
    cancel: CancellationToken,
}

impl BackendWatch {
    pub fn new(
        events: mpsc::Receiver<BackendResult<BackendEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { events, cancel }
    }

    pub async fn recv(&mut self) -> Option<BackendResult<BackendEvent>> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BackendWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<GetResponse>;

    /// Keys under `prefix` in ascending order, strictly after `start_after`
    async fn range(
        &self,
        prefix: &str,
        start_after: Option<String>,
        limit: Option<usize>,
    ) -> BackendResult<RangeResponse>;

    /// Create-if-absent. `ttl == 0` means no expiry.
    async fn create(
        &self,
        key: &str,
        value: Bytes,
        ttl: u64,
    ) -> BackendResult<KeyValue>;

    /// Writes `value` only if the entry's mod revision is still
    /// `expected_mod_revision`. `ttl: None` keeps the current deadline,
    /// `Some(0)` clears it.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected_mod_revision: u64,
        ttl: Option<u64>,
    ) -> BackendResult<KeyValue>;

    /// Removes the key, conditioned on its mod revision when given
    async fn delete(
        &self,
        key: &str,
        expected_mod_revision: Option<u64>,
    ) -> BackendResult<DeleteResponse>;

    /// Streams events with revision `>= start_revision`; `0` starts after
    /// the current revision.
    async fn watch(
        &self,
        target: WatchTarget,
        start_revision: u64,
    ) -> BackendResult<BackendWatch>;

    async fn current_revision(&self) -> BackendResult<u64>;

    /// Highest revision whose event is no longer retained
    async fn compacted_revision(&self) -> BackendResult<u64>;

    /// Discards history at or below `revision`
    async fn compact(
        &self,
        revision: u64,
    ) -> BackendResult<()>;

    /// Deletes every key whose TTL has passed, returning how many
    async fn purge_expired(&self) -> BackendResult<usize>;
}

/// Opens the backend selected by `config.kind`
pub fn open_backend(config: &BackendConfig) -> BackendResult<Arc<dyn KvBackend>> {
    match config.kind {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::with_config(config))),
        BackendKind::Sled => Ok(Arc::new(SledBackend::open_at(config)?)),
    }
}

pub(crate) fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

pub(crate) fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
