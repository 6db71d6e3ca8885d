//! Typed storage over a [`KvBackend`].
//!
//! `KvStore` is the durable leaf of the storage stack. It owns the key
//! prefix, the codec and the decode cache, and it is the only place where
//! backend failures are translated into [`StorageError`].

mod decode_cache;
mod watcher;


use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::backend::BackendError;
use crate::backend::KeyValue;
use crate::backend::KvBackend;
use crate::backend::WatchTarget;
use crate::config::StoreConfig;
use crate::object::directory_prefix;
use crate::object::Codec;
use crate::object::ObjectList;
use crate::object::StorageObject;
use crate::GetOptions;
use crate::ListOptions;
use crate::Preconditions;
use crate::ResponseMeta;
use crate::Result;
use crate::Storage;
use crate::StorageError;
use crate::StorageMetrics;
use crate::UpdateFn;
use crate::Versioner;
use crate::WatchHandle;
use decode_cache::DecodeCache;

/// Maps a backend failure on `key` into the caller-visible taxonomy
pub(crate) fn to_storage_err(
    err: BackendError,
    key: &str,
    resource_version: u64,
) -> StorageError {
    match err {
        BackendError::NotFound(_) => StorageError::not_found(key, resource_version),
        BackendError::KeyExists { mod_revision, .. } => {
            StorageError::already_exists(key, mod_revision)
        }
        BackendError::CasFailed { current, .. } => StorageError::conflict(key, current),
        BackendError::Compacted {
            requested,
            compacted,
        } => StorageError::ResourceVersionTooOld {
            requested,
            oldest: compacted + 1,
        },
        BackendError::Unavailable(reason) => StorageError::unreachable(key, reason),
        BackendError::Corrupted(reason) => StorageError::Internal(reason),
    }
}

/// Codec plus revision stamping, shared with watch tasks
pub(crate) struct ObjectDecoder<T> {
    codec: Arc<dyn Codec<T>>,
    versioner: Versioner,
    metrics: Arc<StorageMetrics>,
}

impl<T> Clone for ObjectDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            versioner: self.versioner,
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: StorageObject> ObjectDecoder<T> {
    pub(crate) fn decode(
        &self,
        data: &[u8],
        resource_version: u64,
    ) -> Result<T> {
        let mut obj = self.codec.decode(data).map_err(|e| {
            self.metrics.decode_error(T::kind());
            e
        })?;
        self.versioner.update_object(&mut obj, resource_version);
        Ok(obj)
    }
}

pub struct KvStore<T: StorageObject> {
    backend: Arc<dyn KvBackend>,
    decoder: ObjectDecoder<T>,
    versioner: Versioner,
    path_prefix: String,
    cache: DecodeCache<T>,
    metrics: Arc<StorageMetrics>,
    slow_threshold: Duration,
    watch_buffer_size: usize,
}

impl<T: StorageObject> std::fmt::Debug for KvStore<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("kind", &T::kind())
            .field("path_prefix", &self.path_prefix)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<T: StorageObject> KvStore<T> {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        codec: Arc<dyn Codec<T>>,
        config: &StoreConfig,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            backend,
            decoder: ObjectDecoder {
                codec,
                versioner: Versioner,
                metrics: metrics.clone(),
            },
            versioner: Versioner,
            path_prefix: config.path_prefix.trim_end_matches('/').to_string(),
            cache: DecodeCache::new(config.decode_cache_capacity),
            metrics,
            slow_threshold: Duration::from_millis(config.slow_operation_threshold_ms),
            watch_buffer_size: config.watch_buffer_size,
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Full backend key; keys that already carry the prefix are kept
    fn prefixed(
        &self,
        key: &str,
    ) -> String {
        if self.path_prefix.is_empty() || key.starts_with(&self.path_prefix) {
            return key.to_string();
        }
        format!("{}/{}", self.path_prefix, key.trim_start_matches('/'))
    }

    fn decode(
        &self,
        kv: &KeyValue,
    ) -> Result<T> {
        self.decoder.decode(&kv.value, kv.mod_revision)
    }

    /// Decode through the revision-keyed cache
    fn decode_cached(
        &self,
        kv: &KeyValue,
    ) -> Result<T> {
        if !self.cache.is_enabled() {
            return self.decode(kv);
        }
        if let Some(obj) = self.cache.get(kv.mod_revision) {
            self.metrics.decode_cache_lookup(T::kind(), true);
            return Ok(obj);
        }
        self.metrics.decode_cache_lookup(T::kind(), false);
        let obj = self.decode(kv)?;
        self.cache.insert(kv.mod_revision, obj.clone());
        Ok(obj)
    }

    fn encode(
        &self,
        obj: &mut T,
    ) -> Result<bytes::Bytes> {
        self.versioner.prepare_object_for_storage(obj);
        self.decoder.codec.encode(obj)
    }

    fn track<R>(
        &self,
        operation: &str,
        key: &str,
        started: Instant,
        result: &Result<R>,
    ) {
        let elapsed = started.elapsed();
        self.metrics.observe_request(operation, T::kind(), elapsed, result.is_ok());
        if elapsed > self.slow_threshold {
            warn!(
                operation,
                key = %key,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow storage operation"
            );
        }
    }

    async fn create_inner(
        &self,
        key: &str,
        mut obj: T,
        ttl: u64,
    ) -> Result<T> {
        if self.versioner.object_resource_version(&obj)? != 0 {
            return Err(StorageError::Invalid(
                "resourceVersion should not be set on objects to be created".into(),
            )
            .into());
        }
        let data = self.encode(&mut obj)?;
        let kv = self
            .backend
            .create(&self.prefixed(key), data, ttl)
            .await
            .map_err(|e| to_storage_err(e, key, 0))?;
        self.versioner.update_object(&mut obj, kv.mod_revision);
        Ok(obj)
    }

    async fn get_inner(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<T> {
        self.versioner.parse_resource_version(&opts.resource_version)?;
        let resp = self
            .backend
            .get(&self.prefixed(key))
            .await
            .map_err(|e| to_storage_err(e, key, 0))?;
        match resp.kv {
            Some(kv) => self.decode(&kv),
            None if opts.ignore_not_found => Ok(T::default()),
            None => Err(StorageError::not_found(key, 0).into()),
        }
    }

    async fn get_to_list_inner(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        self.versioner.parse_resource_version(&opts.resource_version)?;
        let resp = self
            .backend
            .get(&self.prefixed(key))
            .await
            .map_err(|e| to_storage_err(e, key, 0))?;
        let mut items = Vec::new();
        if let Some(kv) = resp.kv {
            let obj = self.decode_cached(&kv)?;
            if opts.predicate.matches(&obj) {
                items.push(obj);
            }
        }
        Ok(ObjectList::new(items, resp.revision))
    }

    async fn list_inner(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        self.versioner.parse_resource_version(&opts.resource_version)?;
        let prefix = directory_prefix(&self.prefixed(key));
        let mut start_after = match &opts.continue_token {
            Some(token) if !token.starts_with(&prefix) => {
                return Err(StorageError::Invalid(format!(
                    "continue token {token:?} does not belong to {key}"
                ))
                .into());
            }
            token => token.clone(),
        };

        let limit = opts.limit.filter(|l| *l > 0);
        let mut items = Vec::new();
        let mut revision = None;
        loop {
            let page = self
                .backend
                .range(&prefix, start_after.clone(), limit)
                .await
                .map_err(|e| to_storage_err(e, key, 0))?;
            // All pages of one call report the first page's revision.
            let list_revision = *revision.get_or_insert(page.revision);

            let mut last_key = None;
            for kv in &page.kvs {
                let obj = self.decode_cached(kv)?;
                if opts.predicate.matches(&obj) {
                    items.push(obj);
                }
                last_key = Some(kv.key.clone());
                if limit.is_some_and(|l| items.len() >= l) {
                    break;
                }
            }

            let exhausted = limit.is_some_and(|l| items.len() >= l);
            let scanned_whole_page =
                last_key.as_deref() == page.kvs.last().map(|kv| kv.key.as_str());
            let more = page.more || !scanned_whole_page;
            if !more || exhausted || limit.is_none() || last_key.is_none() {
                let mut list = ObjectList::new(items, list_revision);
                if more && limit.is_some() {
                    list.continue_token = last_key;
                }
                return Ok(list);
            }
            start_after = last_key;
        }
    }

    async fn delete_inner(
        &self,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> Result<T> {
        let full = self.prefixed(key);
        let Some(preconditions) = preconditions else {
            let resp = self
                .backend
                .delete(&full, None)
                .await
                .map_err(|e| to_storage_err(e, key, 0))?;
            return self.decoder.decode(&resp.prev_kv.value, resp.revision);
        };

        loop {
            let current = self
                .backend
                .get(&full)
                .await
                .map_err(|e| to_storage_err(e, key, 0))?
                .kv
                .ok_or_else(|| StorageError::not_found(key, 0))?;
            let obj = self.decode(&current)?;
            preconditions.check(key, &obj)?;

            match self.backend.delete(&full, Some(current.mod_revision)).await {
                Ok(resp) => return self.decoder.decode(&resp.prev_kv.value, resp.revision),
                Err(BackendError::CasFailed { .. }) => {
                    debug!(key = %key, "deletion failed because of a conflict, going to retry");
                }
                Err(e) => return Err(to_storage_err(e, key, current.mod_revision).into()),
            }
        }
    }

    async fn guaranteed_update_inner(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&Preconditions>,
        try_update: &UpdateFn<T>,
    ) -> Result<T> {
        let full = self.prefixed(key);
        loop {
            let resp = self
                .backend
                .get(&full)
                .await
                .map_err(|e| to_storage_err(e, key, 0))?;
            let (current, stored) = match resp.kv {
                Some(kv) => (self.decode(&kv)?, Some(kv)),
                None if ignore_not_found => (T::default(), None),
                None => return Err(StorageError::not_found(key, 0).into()),
            };
            if let Some(preconditions) = preconditions {
                preconditions.check(key, &current)?;
            }

            let meta = ResponseMeta {
                ttl: stored.as_ref().map_or(0, KeyValue::ttl_remaining),
                resource_version: stored.as_ref().map_or(0, |kv| kv.mod_revision),
            };
            let (mut desired, ttl) = try_update(current.clone(), meta)?;
            let data = self.encode(&mut desired)?;

            let Some(stored) = stored else {
                match self.backend.create(&full, data, ttl.unwrap_or(0)).await {
                    Ok(kv) => {
                        self.versioner.update_object(&mut desired, kv.mod_revision);
                        return Ok(desired);
                    }
                    Err(BackendError::KeyExists { .. }) => {
                        debug!(key = %key, "key created concurrently, going to retry");
                        continue;
                    }
                    Err(e) => return Err(to_storage_err(e, key, 0).into()),
                }
            };

            if data == stored.value {
                // Nothing to write: the stored state already is the desired one.
                return Ok(current);
            }

            match self
                .backend
                .compare_and_swap(&full, data, stored.mod_revision, ttl)
                .await
            {
                Ok(kv) => {
                    self.versioner.update_object(&mut desired, kv.mod_revision);
                    return Ok(desired);
                }
                Err(BackendError::CasFailed { .. }) | Err(BackendError::NotFound(_)) => {
                    debug!(key = %key, revision = stored.mod_revision, "compare-and-swap lost, going to retry");
                }
                Err(e) => return Err(to_storage_err(e, key, stored.mod_revision).into()),
            }
        }
    }

    async fn watch_inner(
        &self,
        key: &str,
        opts: &ListOptions,
        recursive: bool,
    ) -> Result<WatchHandle<T>> {
        let rv = self.versioner.parse_resource_version(&opts.resource_version)?;
        let full = self.prefixed(key);
        let target = if recursive {
            WatchTarget::Prefix(directory_prefix(&full))
        } else {
            WatchTarget::Key(full.clone())
        };

        let (initial, start_revision) = if rv == 0 {
            let (kvs, revision) = if recursive {
                let page = self
                    .backend
                    .range(&directory_prefix(&full), None, None)
                    .await
                    .map_err(|e| to_storage_err(e, key, 0))?;
                (page.kvs, page.revision)
            } else {
                let resp = self
                    .backend
                    .get(&full)
                    .await
                    .map_err(|e| to_storage_err(e, key, 0))?;
                (resp.kv.into_iter().collect(), resp.revision)
            };
            let mut initial = Vec::with_capacity(kvs.len());
            for kv in &kvs {
                let obj = self.decode_cached(kv)?;
                if opts.predicate.matches(&obj) {
                    initial.push(obj);
                }
            }
            (initial, revision + 1)
        } else {
            (Vec::new(), rv + 1)
        };

        let backend_watch = self
            .backend
            .watch(target, start_revision)
            .await
            .map_err(|e| to_storage_err(e, key, rv))?;
        debug!(key = %key, recursive, start_revision, "watch started");

        Ok(watcher::spawn_watch(
            key.to_string(),
            backend_watch,
            self.decoder.clone(),
            opts.predicate.clone(),
            initial,
            self.watch_buffer_size,
        ))
    }
}

#[async_trait]
impl<T: StorageObject> Storage<T> for KvStore<T> {
    fn versioner(&self) -> &Versioner {
        &self.versioner
    }

    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: u64,
    ) -> Result<T> {
        let started = Instant::now();
        let result = self.create_inner(key, obj, ttl).await;
        self.track("create", key, started, &result);
        result
    }

    async fn delete(
        &self,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = self.delete_inner(key, preconditions).await;
        self.track("delete", key, started, &result);
        result
    }

    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<T> {
        let started = Instant::now();
        let result = self.get_inner(key, opts).await;
        self.track("get", key, started, &result);
        result
    }

    async fn get_to_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        let started = Instant::now();
        let result = self.get_to_list_inner(key, opts).await;
        self.track("get_to_list", key, started, &result);
        result
    }

    async fn list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>> {
        let started = Instant::now();
        let result = self.list_inner(key, opts).await;
        self.track("list", key, started, &result);
        result
    }

    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>> {
        self.watch_inner(key, opts, false).await
    }

    async fn watch_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>> {
        self.watch_inner(key, opts, true).await
    }

    async fn guaranteed_update(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&Preconditions>,
        try_update: &UpdateFn<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = self
            .guaranteed_update_inner(key, ignore_not_found, preconditions, try_update)
            .await;
        self.track("guaranteed_update", key, started, &result);
        result
    }
}
