use std::sync::Arc;

use crate::backend::KvBackend;
use crate::backend::MemoryBackend;
use crate::config::BackendConfig;
use crate::config::StorageConfig;
use crate::config::StoreConfig;
use crate::object::namespaced_keys;
use crate::object::BincodeCodec;
use crate::Cacher;
use crate::KvStore;
use crate::Storage;
use crate::StorageMetrics;

use super::Pod;

pub fn test_metrics() -> Arc<StorageMetrics> {
    Arc::new(StorageMetrics::new().expect("metrics registry"))
}

pub fn store_over(
    backend: Arc<dyn KvBackend>,
    metrics: Arc<StorageMetrics>,
) -> KvStore<Pod> {
    KvStore::new(
        backend,
        Arc::new(BincodeCodec::<Pod>::new()),
        &StoreConfig::default(),
        metrics,
    )
}

/// A pod store over a fresh in-memory backend
pub fn memory_store() -> (KvStore<Pod>, Arc<MemoryBackend>, Arc<StorageMetrics>) {
    memory_store_with(&BackendConfig::default())
}

pub fn memory_store_with(
    config: &BackendConfig,
) -> (KvStore<Pod>, Arc<MemoryBackend>, Arc<StorageMetrics>) {
    let backend = Arc::new(MemoryBackend::with_config(config));
    let metrics = test_metrics();
    let store = store_over(backend.clone(), metrics.clone());
    (store, backend, metrics)
}

/// Cacher settings sized for tests
pub fn test_storage_config() -> StorageConfig {
    let mut config = StorageConfig::default();
    config.cacher.bookmark_interval_ms = 50;
    config.cacher.list_wait_timeout_ms = 1000;
    config.retry.relist.base_delay_ms = 10;
    config.retry.relist.max_delay_ms = 50;
    config
}

/// A pod cacher over `storage` for the `pods` resource
pub fn start_cacher(
    storage: Arc<dyn Storage<Pod>>,
    config: &StorageConfig,
    metrics: Arc<StorageMetrics>,
) -> Cacher<Pod> {
    Cacher::new(config, storage, "pods", namespaced_keys::<Pod>("pods"), metrics)
}
