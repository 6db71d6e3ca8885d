//! Watch cache in front of a [`Storage`] implementation.
//!
//! Reads and watches are served from memory: a [`Reflector`] keeps an
//! [`EventWindow`] of recent events and the latest state of every object
//! under one resource prefix. Writes go straight to the backing storage and
//! come back through the reflector's watch.
//!
//! [`Reflector`]: reflector::Reflector
//! [`EventWindow`]: event_window::EventWindow

mod event_window;
mod reflector;
mod registry;

#[cfg(test)]
mod cacher_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
pub use reflector::ReflectorPhase;
pub use reflector::ReflectorStatus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::backend::WatchTarget;
use crate::config::StorageConfig;
use crate::object::directory_prefix;
use crate::object::KeyFunc;
use crate::object::ObjectList;
use crate::object::StorageObject;
use crate::GetOptions;
use crate::ListOptions;
use crate::Preconditions;
use crate::Result;
use crate::Storage;
use crate::StorageError;
use crate::StorageMetrics;
use crate::UpdateFn;
use crate::Versioner;
use crate::WatchHandle;
use event_window::EventWindow;
use event_window::WatchCacheEvent;
use reflector::Reflector;
use registry::SessionSpec;
use registry::WatcherRegistry;

/// Window and sessions; the window lock also orders dispatch against
/// session registration.
pub(crate) struct CacheState<T> {
    window: RwLock<EventWindow<T>>,
    registry: WatcherRegistry<T>,
}

pub struct Cacher<T: StorageObject> {
    storage: Arc<dyn Storage<T>>,
    state: Arc<CacheState<T>>,
    status: watch::Receiver<ReflectorStatus>,
    versioner: Versioner,
    wait_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: StorageObject> std::fmt::Debug for Cacher<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("kind", &T::kind())
            .field("status", &*self.status.borrow())
            .field("watchers", &self.state.registry.len())
            .finish_non_exhaustive()
    }
}

impl<T: StorageObject> Cacher<T> {
    /// Starts the reflector and bookmark tasks for `resource_prefix`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: &StorageConfig,
        storage: Arc<dyn Storage<T>>,
        resource_prefix: impl Into<String>,
        key_func: KeyFunc<T>,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        let resource_prefix = resource_prefix.into();
        let cacher_config = &config.cacher;
        let state = Arc::new(CacheState {
            window: RwLock::new(EventWindow::new(cacher_config.window_capacity)),
            registry: WatcherRegistry::new(
                cacher_config.input_queue_size,
                cacher_config.output_queue_size,
                Duration::from_millis(cacher_config.dispatch_timeout_ms),
                metrics.clone(),
            ),
        });
        let (status_tx, status_rx) = watch::channel(ReflectorStatus::initializing());
        let cancel = CancellationToken::new();

        let reflector = Reflector::new(
            storage.clone(),
            resource_prefix.clone(),
            key_func,
            state.clone(),
            status_tx,
            config.retry.relist,
            metrics,
            cancel.child_token(),
        );
        let reflector_task = tokio::spawn(reflector.run());
        let bookmark_task = tokio::spawn(run_bookmarks(
            state.clone(),
            status_rx.clone(),
            Duration::from_millis(cacher_config.bookmark_interval_ms.max(1)),
            cancel.child_token(),
        ));
        info!(prefix = %resource_prefix, kind = T::kind(), "cacher started");

        Self {
            storage,
            state,
            status: status_rx,
            versioner: Versioner,
            wait_timeout: Duration::from_millis(cacher_config.list_wait_timeout_ms),
            cancel,
            tasks: Mutex::new(vec![reflector_task, bookmark_task]),
        }
    }

    /// Stops background tasks and closes every watcher. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.state.registry.close_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(kind = T::kind(), "cacher stopped");
    }

    pub fn status(&self) -> ReflectorStatus {
        *self.status.borrow()
    }

    /// Waits for the initial sync, bounded by `list_wait_timeout_ms`
    pub async fn ready(&self) -> Result<()> {
        self.wait_fresh(0, self.wait_timeout).await
    }

    /// resourceVersion of the latest state held, once synced
    pub async fn last_sync_resource_version(&self) -> Result<u64> {
        self.ready().await?;
        Ok(self.state.window.read().resource_version())
    }

    pub fn watcher_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Waits until the cache is synced and holds `resource_version`
    async fn wait_fresh(
        &self,
        resource_version: u64,
        timeout: Duration,
    ) -> Result<()> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| {
                s.phase == ReflectorPhase::Stopped
                    || (s.phase == ReflectorPhase::Synced && s.resource_version >= resource_version)
            }),
        )
        .await
        .map(|changed| changed.map(|_| ()));

        let current = *self.status.borrow();
        match waited {
            Ok(Ok(_)) if current.phase != ReflectorPhase::Stopped => Ok(()),
            Ok(_) => Err(StorageError::unreachable(T::kind(), "cacher is stopped").into()),
            Err(_) if resource_version == 0 || current.phase == ReflectorPhase::Initializing => {
                Err(StorageError::unreachable(T::kind(), "cacher has not synced yet").into())
            }
            Err(_) => Err(StorageError::ResourceVersionTooLarge {
                requested: resource_version,
                current: current.resource_version,
            }
            .into()),
        }
    }

    /// Parses the requested point, rejects history the window dropped and
    /// waits for points not observed yet
    async fn prepare_read(
        &self,
        resource_version: &str,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let rv = self.versioner.parse_resource_version(resource_version)?;
        self.wait_fresh(rv, timeout.unwrap_or(self.wait_timeout)).await?;
        if rv != 0 {
            self.state.window.read().check_not_too_old(rv)?;
        }
        Ok(rv)
    }

    async fn watch_target(
        &self,
        target: WatchTarget,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>> {
        let rv = self.versioner.parse_resource_version(&opts.resource_version)?;
        self.ready().await?;

        let window = self.state.window.read();
        let (replay, cursor) = if rv == 0 {
            let current = window.resource_version();
            let replay = window
                .objects(&target)
                .into_iter()
                .map(|(key, obj)| {
                    let obj_rv = self.versioner.object_resource_version(obj).unwrap_or(current);
                    Arc::new(WatchCacheEvent::added(key.clone(), obj.clone(), obj_rv))
                })
                .collect();
            (replay, current)
        } else {
            match window.since(rv, &target) {
                Ok(replay) => (replay, rv),
                Err(e) => {
                    debug!(kind = T::kind(), requested = rv, error = %e, "watch start predates window");
                    return Ok(WatchHandle::closed_with(e));
                }
            }
        };

        let spec = SessionSpec {
            target,
            predicate: opts.predicate.clone(),
            min_resource_version: rv,
            cursor,
        };
        Ok(self.state.registry.register(spec, replay))
    }
}

impl<T: StorageObject> Drop for Cacher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_bookmarks<T: StorageObject>(
    state: Arc<CacheState<T>>,
    status: watch::Receiver<ReflectorStatus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if status.borrow().phase != ReflectorPhase::Synced {
                    continue;
                }
                let window = state.window.read();
                state.registry.bookmark(window.resource_version());
            }
        }
    }
}

#[async_trait]
impl<T: StorageObject> Storage<T> for Cacher<T> {
    fn versioner(&self) -> &Versioner {
        &self.versioner
    }

    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: u64,
    ) -> Result<T> {
        self.storage.create(key, obj, ttl).await
    }

    async fn delete(
        &self,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> Result<T> {
        self.storage.delete(key, preconditions).await
    }

    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<T> {
        let rv = self.prepare_read(&opts.resource_version, None).await?;
        let window = self.state.window.read();
        match window.get(key) {
            Some(obj) => Ok(obj.clone()),
            None if opts.ignore_not_found => Ok(T::default()),
            None => Err(StorageError::not_found(key, rv).into()),
        }
    }

    async fn get_to_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        self.prepare_read(&opts.resource_version, opts.timeout).await?;
        let window = self.state.window.read();
        let items = window
            .get(key)
            .filter(|obj| opts.predicate.matches(*obj))
            .cloned()
            .into_iter()
            .collect();
        Ok(ObjectList::new(items, window.resource_version()))
    }

    async fn list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        if opts.is_paginated() {
            return self.storage.list(key, opts).await;
        }
        self.prepare_read(&opts.resource_version, opts.timeout).await?;
        let window = self.state.window.read();
        let items = window
            .objects(&WatchTarget::Prefix(directory_prefix(key)))
            .into_iter()
            .filter(|(_, obj)| opts.predicate.matches(*obj))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList::new(items, window.resource_version()))
    }

    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>> {
        self.watch_target(WatchTarget::Key(key.to_string()), opts).await
    }

    async fn watch_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>> {
        self.watch_target(WatchTarget::Prefix(directory_prefix(key)), opts).await
    }

    async fn guaranteed_update(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&Preconditions>,
        try_update: &UpdateFn<T>,
    ) -> Result<T> {
        self.storage
            .guaranteed_update(key, ignore_not_found, preconditions, try_update)
            .await
    }
}
