//! List-then-watch loop feeding one cacher.
//!
//! ```text
//! Initializing --list--> Synced --watch TooOld--> Relisting --list--> Synced
//! ```
//!
//! A watch that simply ends is reopened from the last ingested
//! resourceVersion without relisting. Other failures back off using
//! `retry.relist`, whose `timeout_ms` bounds each list and watch open.
//! Once retries are exhausted every session is closed as unreachable.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CacheState;
use crate::config::BackoffPolicy;
use crate::object::KeyFunc;
use crate::object::StorageObject;
use crate::Error;
use crate::ListOptions;
use crate::Result;
use crate::Storage;
use crate::StorageError;
use crate::StorageMetrics;
use crate::WatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorPhase {
    Initializing,
    Synced,
    Relisting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectorStatus {
    pub phase: ReflectorPhase,
    /// Latest resourceVersion held by the cache
    pub resource_version: u64,
}

impl ReflectorStatus {
    pub(crate) fn initializing() -> Self {
        Self {
            phase: ReflectorPhase::Initializing,
            resource_version: 0,
        }
    }
}

enum WatchOutcome {
    /// Stream ended; resume from the carried resourceVersion
    Ended(u64),
    TooOld,
    Failed(u64, Error),
    Cancelled,
}

pub(crate) struct Reflector<T: StorageObject> {
    storage: Arc<dyn Storage<T>>,
    resource_prefix: String,
    key_func: KeyFunc<T>,
    state: Arc<CacheState<T>>,
    status: watch::Sender<ReflectorStatus>,
    backoff: BackoffPolicy,
    metrics: Arc<StorageMetrics>,
    cancel: CancellationToken,
    attempt: usize,
}

impl<T: StorageObject> Reflector<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn Storage<T>>,
        resource_prefix: String,
        key_func: KeyFunc<T>,
        state: Arc<CacheState<T>>,
        status: watch::Sender<ReflectorStatus>,
        backoff: BackoffPolicy,
        metrics: Arc<StorageMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage,
            resource_prefix,
            key_func,
            state,
            status,
            backoff,
            metrics,
            cancel,
            attempt: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut gave_up = None;
        'relist: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let baseline = match self.relist().await {
                Ok(rv) => rv,
                Err(e) => {
                    if self.back_off("list", &e).await {
                        continue;
                    }
                    gave_up = Some(e);
                    break;
                }
            };

            let mut from = baseline;
            loop {
                match self.watch_from(from).await {
                    WatchOutcome::Ended(last) => {
                        debug!(prefix = %self.resource_prefix, from = last, "watch ended, reopening");
                        from = last;
                    }
                    WatchOutcome::TooOld => {
                        warn!(prefix = %self.resource_prefix, from, "watch start compacted, relisting");
                        self.status.send_modify(|s| s.phase = ReflectorPhase::Relisting);
                        continue 'relist;
                    }
                    WatchOutcome::Failed(last, e) => {
                        if !self.back_off("watch", &e).await {
                            gave_up = Some(e);
                            break 'relist;
                        }
                        from = last;
                    }
                    WatchOutcome::Cancelled => break 'relist,
                }
            }
        }

        self.status.send_modify(|s| s.phase = ReflectorPhase::Stopped);
        if let Some(e) = gave_up.filter(|_| !self.cancel.is_cancelled()) {
            let closed = self.state.registry.terminate_all(
                StorageError::unreachable(self.resource_prefix.clone(), e.to_string()),
                "unreachable",
            );
            warn!(prefix = %self.resource_prefix, closed, "closed watchers of abandoned cache");
        }
        info!(prefix = %self.resource_prefix, "reflector stopped");
    }

    /// Replaces the cache with a fresh list and returns its baseline
    async fn relist(&mut self) -> Result<u64> {
        let list = tokio::time::timeout(
            self.backoff.timeout(),
            self.storage.list(&self.resource_prefix, &ListOptions::default()),
        )
        .await
        .map_err(|_| StorageError::unreachable(self.resource_prefix.clone(), "list timed out"))??;
        self.metrics.relisted(T::kind());
        let baseline = self.storage.versioner().parse_resource_version(&list.resource_version)?;

        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items {
            items.push(((self.key_func)(&obj)?, obj));
        }
        let count = items.len();

        let terminated = {
            let mut window = self.state.window.write();
            window.replace(items, baseline);
            self.state.registry.terminate_stale(baseline)
        };
        self.metrics.set_window_size(T::kind(), 0);
        self.status.send_replace(ReflectorStatus {
            phase: ReflectorPhase::Synced,
            resource_version: baseline,
        });
        self.attempt = 0;
        info!(prefix = %self.resource_prefix, baseline, items = count, terminated, "cache synced");
        Ok(baseline)
    }

    async fn watch_from(
        &mut self,
        from: u64,
    ) -> WatchOutcome {
        let opts = ListOptions::at(from.to_string());
        let opened = tokio::time::timeout(
            self.backoff.timeout(),
            self.storage.watch_list(&self.resource_prefix, &opts),
        )
        .await;
        let mut handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) if e.is_too_old_resource_version() => return WatchOutcome::TooOld,
            Ok(Err(e)) => return WatchOutcome::Failed(from, e),
            Err(_) => {
                let e = StorageError::unreachable(self.resource_prefix.clone(), "watch open timed out");
                return WatchOutcome::Failed(from, e.into());
            }
        };

        let mut last = from;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WatchOutcome::Cancelled,
                next = handle.recv() => next,
            };
            match next {
                None => return WatchOutcome::Ended(last),
                Some(WatchEvent::Error(e)) if e.is_too_old_resource_version() => {
                    return WatchOutcome::TooOld;
                }
                Some(WatchEvent::Error(e)) => return WatchOutcome::Failed(last, e.into()),
                Some(WatchEvent::Bookmark(_)) => {}
                Some(event) => {
                    if let Some(rv) = self.ingest(event).await {
                        last = rv;
                        self.attempt = 0;
                    }
                }
            }
        }
    }

    /// Applies one event to the window and fans it out. Returns once every
    /// matching session has the event queued or has been closed.
    async fn ingest(
        &self,
        event: WatchEvent<T>,
    ) -> Option<u64> {
        let key = match event.object().map(|obj| (self.key_func)(obj)) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                warn!(prefix = %self.resource_prefix, error = %e, "cannot key watched object, skipping");
                return None;
            }
            None => return None,
        };

        let (rv, size, dispatch) = {
            let mut window = self.state.window.write();
            let cached = window.process(key, event)?;
            let dispatch = self.state.registry.dispatch(&cached);
            (cached.resource_version, window.len(), dispatch)
        };
        self.metrics.set_window_size(T::kind(), size);
        self.status.send_modify(|s| s.resource_version = rv);
        if !dispatch.is_complete() {
            self.state.registry.finish(dispatch).await;
        }
        Some(rv)
    }

    /// Sleeps before the next attempt; `false` when the loop must stop
    async fn back_off(
        &mut self,
        operation: &str,
        err: &Error,
    ) -> bool {
        self.attempt += 1;
        if !self.backoff.allows(self.attempt) {
            error!(prefix = %self.resource_prefix, operation, attempts = self.attempt, error = %err, "giving up");
            return false;
        }
        let delay = self.backoff.delay(self.attempt);
        warn!(
            prefix = %self.resource_prefix,
            operation,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "reflector retrying"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
