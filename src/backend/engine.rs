//! Revisioned key-value engine shared by the memory and sled adaptors.
//!
//! All operations run under one `parking_lot::Mutex`; the watch hub is fed
//! while that lock is held so live events leave in revision order.

use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

use super::now_ms;
use super::watch_hub::EventSource;
use super::watch_hub::History;
use super::watch_hub::WatchHub;
use super::BackendError;
use super::BackendEvent;
use super::BackendResult;
use super::BackendWatch;
use super::DeleteResponse;
use super::EventKind;
use super::GetResponse;
use super::KeyValue;
use super::KvBackend;
use super::RangeResponse;
use super::TtlIndex;
use super::WatchTarget;
use crate::config::BackendConfig;

/// Physical layout used by [`MvccEngine`].
///
/// `apply` must make the entry change, the history append and the new
/// revision durable together.
pub trait Tables: Send + 'static {
    /// `(revision, compacted_revision)` found at open
    fn load_revisions(&self) -> BackendResult<(u64, u64)>;

    fn get(
        &self,
        key: &str,
    ) -> BackendResult<Option<KeyValue>>;

    /// Entries under `prefix` strictly after `start_after`, plus whether
    /// more remain beyond `limit`
    fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: Option<usize>,
    ) -> BackendResult<(Vec<KeyValue>, bool)>;

    fn apply(
        &mut self,
        event: &BackendEvent,
    ) -> BackendResult<()>;

    /// Retained events with revision in `[from, to]`
    fn events(
        &self,
        from: u64,
        to: u64,
    ) -> BackendResult<Vec<BackendEvent>>;

    /// Drops history at or below `revision` and records it as compacted
    fn compact(
        &mut self,
        revision: u64,
    ) -> BackendResult<()>;

    /// `(key, deadline)` of every entry carrying a TTL
    fn deadlines(&self) -> BackendResult<Vec<(String, u64)>>;
}

/// Collects up to `limit` items from an ordered iterator of entries.
pub(crate) fn take_page<I>(
    iter: I,
    limit: Option<usize>,
) -> BackendResult<(Vec<KeyValue>, bool)>
where
    I: Iterator<Item = BackendResult<KeyValue>>,
{
    let mut page = Vec::new();
    let mut iter = iter.peekable();
    while let Some(item) = iter.next() {
        page.push(item?);
        if limit.is_some_and(|l| page.len() >= l) {
            return Ok((page, iter.peek().is_some()));
        }
    }
    Ok((page, false))
}

/// Lower bound for a prefix scan resuming after `start_after`
pub(crate) fn scan_start<'a>(
    prefix: &'a str,
    start_after: Option<&'a str>,
) -> Bound<&'a str> {
    match start_after {
        Some(after) if after >= prefix => Bound::Excluded(after),
        _ => Bound::Included(prefix),
    }
}

struct EngineState<S> {
    tables: S,
    revision: u64,
    compacted: u64,
    ttl: TtlIndex,
    /// Retained events, `0` for unbounded
    history_limit: u64,
}

struct EngineInner<S> {
    state: Mutex<EngineState<S>>,
    hub: WatchHub,
}

pub struct MvccEngine<S: Tables> {
    inner: Arc<EngineInner<S>>,
}

impl<S: Tables> std::fmt::Debug for MvccEngine<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MvccEngine")
            .field("revision", &state.revision)
            .field("compacted", &state.compacted)
            .field("ttl_keys", &state.ttl.len())
            .finish_non_exhaustive()
    }
}

impl<S: Tables> MvccEngine<S> {
    /// Restores revisions and TTL deadlines from `tables`
    pub fn open(
        tables: S,
        config: &BackendConfig,
    ) -> BackendResult<Self> {
        let (revision, compacted) = tables.load_revisions()?;
        let mut ttl = TtlIndex::new();
        for (key, deadline) in tables.deadlines()? {
            ttl.register(&key, deadline);
        }
        debug!(revision, compacted, ttl_keys = ttl.len(), "backend opened");

        Ok(Self::assemble(tables, revision, compacted, ttl, config))
    }

    pub(crate) fn assemble(
        tables: S,
        revision: u64,
        compacted: u64,
        ttl: TtlIndex,
        config: &BackendConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    tables,
                    revision,
                    compacted,
                    ttl,
                    history_limit: config.history_limit,
                }),
                hub: WatchHub::new(config.watch_channel_capacity, config.watcher_buffer_size),
            }),
        }
    }
}

impl<S: Tables> EngineState<S> {
    fn commit(
        &mut self,
        event: BackendEvent,
        hub: &WatchHub,
    ) -> BackendResult<()> {
        self.tables.apply(&event)?;
        self.revision = event.revision;
        trace!(revision = event.revision, key = %event.kv.key, kind = ?event.kind, "committed");
        hub.publish(event);

        if self.history_limit > 0 && self.revision - self.compacted > self.history_limit {
            let cutoff = self.revision - self.history_limit;
            self.tables.compact(cutoff)?;
            self.compacted = cutoff;
        }
        Ok(())
    }

    /// Deletes keys whose TTL passed; runs before every operation
    fn expire_due(
        &mut self,
        hub: &WatchHub,
    ) -> BackendResult<usize> {
        let now = now_ms();
        if !self.ttl.may_have_expired(now) {
            return Ok(0);
        }
        let mut expired = 0;
        for key in self.ttl.take_expired(now) {
            let Some(prev) = self.tables.get(&key)? else {
                continue;
            };
            if !prev.expires_at_ms.is_some_and(|deadline| deadline <= now) {
                continue;
            }
            debug!(key = %key, "key expired");
            self.commit_delete(prev, hub)?;
            expired += 1;
        }
        Ok(expired)
    }

    fn commit_delete(
        &mut self,
        prev: KeyValue,
        hub: &WatchHub,
    ) -> BackendResult<u64> {
        let revision = self.revision + 1;
        self.ttl.unregister(&prev.key);
        let event = BackendEvent {
            kind: EventKind::Delete,
            revision,
            kv: KeyValue {
                key: prev.key.clone(),
                value: Bytes::new(),
                create_revision: prev.create_revision,
                mod_revision: revision,
                expires_at_ms: None,
            },
            prev_kv: Some(prev),
        };
        self.commit(event, hub)?;
        Ok(revision)
    }

    fn history_since(
        &self,
        from: u64,
    ) -> BackendResult<History> {
        if from == 0 {
            return Ok(History {
                events: Vec::new(),
                current: self.revision,
            });
        }
        if from <= self.compacted {
            return Err(BackendError::Compacted {
                requested: from,
                compacted: self.compacted,
            });
        }
        Ok(History {
            events: self.tables.events(from, self.revision)?,
            current: self.revision,
        })
    }
}

impl<S: Tables> EventSource for EngineInner<S> {
    fn history_since(
        &self,
        from: u64,
    ) -> BackendResult<History> {
        self.state.lock().history_since(from)
    }
}

#[async_trait]
impl<S: Tables> KvBackend for MvccEngine<S> {
    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<GetResponse> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)?;
        Ok(GetResponse {
            kv: state.tables.get(key)?,
            revision: state.revision,
        })
    }

    async fn range(
        &self,
        prefix: &str,
        start_after: Option<String>,
        limit: Option<usize>,
    ) -> BackendResult<RangeResponse> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)?;
        let (kvs, more) = state.tables.scan(prefix, start_after.as_deref(), limit)?;
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
            more,
        })
    }

    async fn create(
        &self,
        key: &str,
        value: Bytes,
        ttl: u64,
    ) -> BackendResult<KeyValue> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)?;
        if let Some(existing) = state.tables.get(key)? {
            return Err(BackendError::KeyExists {
                key: key.to_string(),
                mod_revision: existing.mod_revision,
            });
        }

        let revision = state.revision + 1;
        let expires_at_ms = (ttl > 0).then(|| TtlIndex::deadline_after(ttl));
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: revision,
            mod_revision: revision,
            expires_at_ms,
        };
        if let Some(deadline) = expires_at_ms {
            state.ttl.register(key, deadline);
        }
        state.commit(
            BackendEvent {
                kind: EventKind::Put,
                revision,
                kv: kv.clone(),
                prev_kv: None,
            },
            &self.inner.hub,
        )?;
        Ok(kv)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected_mod_revision: u64,
        ttl: Option<u64>,
    ) -> BackendResult<KeyValue> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)?;
        let prev = state
            .tables
            .get(key)?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        if prev.mod_revision != expected_mod_revision {
            return Err(BackendError::CasFailed {
                key: key.to_string(),
                current: prev.mod_revision,
            });
        }

        let revision = state.revision + 1;
        let expires_at_ms = match ttl {
            None => prev.expires_at_ms,
            Some(0) => None,
            Some(secs) => Some(TtlIndex::deadline_after(secs)),
        };
        match expires_at_ms {
            Some(deadline) => state.ttl.register(key, deadline),
            None => state.ttl.unregister(key),
        }
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.create_revision,
            mod_revision: revision,
            expires_at_ms,
        };
        state.commit(
            BackendEvent {
                kind: EventKind::Put,
                revision,
                kv: kv.clone(),
                prev_kv: Some(prev),
            },
            &self.inner.hub,
        )?;
        Ok(kv)
    }

    async fn delete(
        &self,
        key: &str,
        expected_mod_revision: Option<u64>,
    ) -> BackendResult<DeleteResponse> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)?;
        let prev = state
            .tables
            .get(key)?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        if let Some(expected) = expected_mod_revision {
            if prev.mod_revision != expected {
                return Err(BackendError::CasFailed {
                    key: key.to_string(),
                    current: prev.mod_revision,
                });
            }
        }
        let revision = state.commit_delete(prev.clone(), &self.inner.hub)?;
        Ok(DeleteResponse {
            prev_kv: prev,
            revision,
        })
    }

    async fn watch(
        &self,
        target: WatchTarget,
        start_revision: u64,
    ) -> BackendResult<BackendWatch> {
        // "After current" is pinned at call time, not when the task runs.
        let start = match start_revision {
            0 => self.inner.state.lock().revision + 1,
            rev => rev,
        };
        let source: Arc<dyn EventSource> = self.inner.clone();
        Ok(self.inner.hub.watch(source, target, start))
    }

    async fn current_revision(&self) -> BackendResult<u64> {
        Ok(self.inner.state.lock().revision)
    }

    async fn compacted_revision(&self) -> BackendResult<u64> {
        Ok(self.inner.state.lock().compacted)
    }

    async fn compact(
        &self,
        revision: u64,
    ) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        let revision = revision.min(state.revision);
        if revision <= state.compacted {
            return Ok(());
        }
        state.tables.compact(revision)?;
        state.compacted = revision;
        debug!(revision, "history compacted");
        Ok(())
    }

    async fn purge_expired(&self) -> BackendResult<usize> {
        let mut state = self.inner.state.lock();
        state.expire_due(&self.inner.hub)
    }
}
