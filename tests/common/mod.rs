#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use storage_cacher::backend::KvBackend;
use storage_cacher::object::namespaced_keys;
use storage_cacher::object::object_meta_fields;
use storage_cacher::object::BincodeCodec;
use storage_cacher::object::FieldSet;
use storage_cacher::object::ObjectMeta;
use storage_cacher::object::StorageObject;
use storage_cacher::Cacher;
use storage_cacher::KvStore;
use storage_cacher::Storage;
use storage_cacher::StorageConfig;
use storage_cacher::StorageMetrics;
use storage_cacher::WatchEvent;
use storage_cacher::WatchHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub node_name: String,
    pub restarts: u64,
}

impl StorageObject for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn fields(&self) -> FieldSet {
        let mut fields = object_meta_fields(&self.metadata);
        fields.insert("spec.nodeName".to_string(), self.node_name.clone());
        fields
    }
}

pub fn pod(
    namespace: &str,
    name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta::new(namespace, name).with_uid(format!("{namespace}/{name}")),
        ..Default::default()
    }
}

pub fn rv(p: &Pod) -> u64 {
    p.metadata.resource_version.parse().unwrap()
}

pub fn test_config() -> StorageConfig {
    let mut config = StorageConfig::default();
    config.cacher.window_capacity = 500;
    config.cacher.input_queue_size = 200;
    config.cacher.output_queue_size = 200;
    config.cacher.bookmark_interval_ms = 50;
    config.cacher.list_wait_timeout_ms = 2000;
    config.retry.relist.base_delay_ms = 10;
    config.retry.relist.max_delay_ms = 100;
    config
}

pub struct Stack {
    pub backend: Arc<dyn KvBackend>,
    pub store: Arc<KvStore<Pod>>,
    pub cacher: Arc<Cacher<Pod>>,
    pub metrics: Arc<StorageMetrics>,
}

/// Store and cacher over `backend`, with the cacher synced
pub async fn stack_over(
    backend: Arc<dyn KvBackend>,
    config: &StorageConfig,
) -> Stack {
    let metrics = Arc::new(StorageMetrics::new().unwrap());
    let store = Arc::new(KvStore::new(
        backend.clone(),
        Arc::new(BincodeCodec::<Pod>::new()),
        &config.store,
        metrics.clone(),
    ));
    let cacher = Arc::new(Cacher::new(
        config,
        store.clone() as Arc<dyn Storage<Pod>>,
        "pods",
        namespaced_keys::<Pod>("pods"),
        metrics.clone(),
    ));
    cacher.ready().await.unwrap();
    Stack {
        backend,
        store,
        cacher,
        metrics,
    }
}

pub async fn next(watch: &mut WatchHandle<Pod>) -> WatchEvent<Pod> {
    tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("watch timed out")
        .expect("watch closed")
}
