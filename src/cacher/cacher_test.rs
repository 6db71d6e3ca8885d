use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::object::FieldSelector;
use crate::object::LabelSelector;
use crate::object::SelectionPredicate;
use crate::test_utils::*;
use crate::KvStore;
use crate::ResponseMeta;
use crate::WatchEvent;

/// Delegating storage that can fail lists and expire watches on demand
struct FlakyStorage {
    inner: Arc<KvStore<Pod>>,
    list_failures: AtomicUsize,
    /// Lists that never answer
    stalled_lists: AtomicUsize,
    lists: AtomicUsize,
    /// Watch forwarders drop events while set
    hold: Arc<AtomicBool>,
    expiry: Mutex<CancellationToken>,
}

impl FlakyStorage {
    fn new(inner: Arc<KvStore<Pod>>) -> Self {
        Self {
            inner,
            list_failures: AtomicUsize::new(0),
            stalled_lists: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            hold: Arc::new(AtomicBool::new(false)),
            expiry: Mutex::new(CancellationToken::new()),
        }
    }

    /// Ends every open watch with `TooOld`
    fn expire_watches(&self) {
        let old = std::mem::replace(&mut *self.expiry.lock(), CancellationToken::new());
        old.cancel();
        self.hold.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage<Pod> for FlakyStorage {
    fn versioner(&self) -> &Versioner {
        self.inner.versioner()
    }

    async fn create(
        &self,
        key: &str,
        obj: Pod,
        ttl: u64,
    ) -> Result<Pod> {
        self.inner.create(key, obj, ttl).await
    }

    async fn delete(
        &self,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> Result<Pod> {
        self.inner.delete(key, preconditions).await
    }

    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<Pod> {
        self.inner.get(key, opts).await
    }

    async fn get_to_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<Pod>> {
        self.inner.get_to_list(key, opts).await
    }

    async fn list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<Pod>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let stalled = self.stalled_lists.load(Ordering::SeqCst);
        if stalled > 0 {
            self.stalled_lists.store(stalled - 1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::unreachable(key, "injected").into());
        }
        self.inner.list(key, opts).await
    }

    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<Pod>> {
        self.inner.watch(key, opts).await
    }

    async fn watch_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<Pod>> {
        let mut upstream = self.inner.watch_list(key, opts).await?;
        let expiry = self.expiry.lock().clone();
        let hold = self.hold.clone();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => return,
                    _ = expiry.cancelled() => {
                        let _ = tx
                            .send(WatchEvent::Error(StorageError::ResourceVersionTooOld {
                                requested: 0,
                                oldest: 0,
                            }))
                            .await;
                        return;
                    }
                    next = upstream.recv() => match next {
                        Some(ev) if !hold.load(Ordering::SeqCst) => {
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        });
        Ok(WatchHandle::new(rx, cancel))
    }

    async fn guaranteed_update(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&Preconditions>,
        try_update: &UpdateFn<Pod>,
    ) -> Result<Pod> {
        self.inner
            .guaranteed_update(key, ignore_not_found, preconditions, try_update)
            .await
    }
}

struct Fixture {
    cacher: Cacher<Pod>,
    store: Arc<KvStore<Pod>>,
    metrics: Arc<StorageMetrics>,
}

async fn fixture_with(config: StorageConfig) -> Fixture {
    let (store, _, metrics) = memory_store();
    let store = Arc::new(store);
    let cacher = start_cacher(store.clone(), &config, metrics.clone());
    cacher.ready().await.unwrap();
    Fixture {
        cacher,
        store,
        metrics,
    }
}

async fn fixture() -> Fixture {
    fixture_with(test_storage_config()).await
}

async fn next(watch: &mut WatchHandle<Pod>) -> WatchEvent<Pod> {
    timeout(Duration::from_secs(3), watch.recv())
        .await
        .expect("watch timed out")
        .expect("watch closed")
}

async fn assert_quiet(
    watch: &mut WatchHandle<Pod>,
    wait: Duration,
) {
    if let Ok(ev) = timeout(wait, watch.recv()).await {
        panic!("unexpected event {ev:?}");
    }
}

fn rv(p: &Pod) -> u64 {
    p.metadata.resource_version.parse().unwrap()
}

fn with_labels(
    mut p: Pod,
    labels: &[(&str, &str)],
) -> Pod {
    for (k, v) in labels {
        p.metadata.labels.insert(k.to_string(), v.to_string());
    }
    p
}

async fn set_node(
    storage: &dyn Storage<Pod>,
    key: &str,
    node: &'static str,
) -> Pod {
    storage
        .guaranteed_update(key, false, None, &move |mut p: Pod, _: ResponseMeta| {
            p.spec.node_name = node.to_string();
            Ok((p, None))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reads_observe_writes_through_cacher() {
    let f = fixture().await;
    let created = f.cacher.create("pods/ns/foo", pod("ns", "foo"), 0).await.unwrap();

    let got = f
        .cacher
        .get("pods/ns/foo", &GetOptions::at(created.metadata.resource_version.clone()))
        .await
        .unwrap();
    assert_eq!(got, created);

    let list = f
        .cacher
        .list("pods/ns", &ListOptions::at(created.metadata.resource_version.clone()))
        .await
        .unwrap();
    assert_eq!(list.items, vec![created.clone()]);
    assert_eq!(list.resource_version, created.metadata.resource_version);

    let single = f
        .cacher
        .get_to_list("pods/ns/foo", &ListOptions::at(created.metadata.resource_version))
        .await
        .unwrap();
    assert_eq!(single.len(), 1);
}

#[tokio::test]
async fn test_get_missing_key() {
    let f = fixture().await;
    assert!(f.cacher.get("pods/ns/foo", &GetOptions::default()).await.unwrap_err().is_not_found());
    assert_eq!(
        f.cacher.get("pods/ns/foo", &GetOptions::ignore_not_found()).await.unwrap(),
        Pod::default()
    );
}

#[tokio::test]
async fn test_list_filters_and_keeps_directory_boundary() {
    let f = fixture().await;
    f.store.create("pods/ns/a", pod_on_node("ns", "a", "n1"), 0).await.unwrap();
    f.store.create("pods/ns/b", pod_on_node("ns", "b", "n2"), 0).await.unwrap();
    let last = f.store.create("pods/ns2/c", pod_on_node("ns2", "c", "n1"), 0).await.unwrap();

    let opts = ListOptions::at(last.metadata.resource_version.clone()).with_predicate(
        SelectionPredicate::new(LabelSelector::everything(), FieldSelector::equals("spec.nodeName", "n1")),
    );
    let list = f.cacher.list("pods/ns", &opts).await.unwrap();
    let names: Vec<_> = list.items.iter().map(|p| p.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["a"]);
}

#[tokio::test]
async fn test_list_ahead_of_cache_fails_with_too_large() {
    let f = fixture().await;
    let current = f.cacher.last_sync_resource_version().await.unwrap();

    let opts = ListOptions::at((current + 100).to_string()).with_timeout(Duration::from_millis(200));
    let err = f.cacher.list("pods/ns", &opts).await.unwrap_err();
    assert!(err.is_too_large_resource_version());
}

#[tokio::test]
async fn test_list_below_window_fails_with_too_old() {
    let mut config = test_storage_config();
    config.cacher.window_capacity = 3;
    let f = fixture_with(config).await;

    let mut last = 0;
    for i in 0..110 {
        last = rv(&f.store.create(&format!("pods/ns/p{i}"), pod("ns", &format!("p{i}")), 0).await.unwrap());
    }
    f.cacher.get_to_list("pods/ns/p0", &ListOptions::at(last.to_string())).await.unwrap();

    let oldest = f.cacher.state.window.read().start_revision();
    let err = f
        .cacher
        .list("pods/ns", &ListOptions::at((oldest - 100).to_string()))
        .await
        .unwrap_err();
    assert!(err.is_too_old_resource_version());
}

#[tokio::test]
async fn test_paginated_list_is_served_by_storage() {
    let f = fixture().await;
    for name in ["a", "b", "c"] {
        f.store.create(&format!("pods/ns/{name}"), pod("ns", name), 0).await.unwrap();
    }

    let page = f.cacher.list("pods/ns", &ListOptions::default().with_limit(2)).await.unwrap();
    assert_eq!(page.len(), 2);
    assert!(page.continue_token.is_some());
    assert_eq!(f.metrics.request_count("list", "Pod"), 2);
}

#[tokio::test]
async fn test_unsynced_cacher_is_unreachable() {
    let (store, _, metrics) = memory_store();
    let flaky = Arc::new(FlakyStorage::new(Arc::new(store)));
    flaky.list_failures.store(usize::MAX, Ordering::SeqCst);
    let mut config = test_storage_config();
    config.cacher.list_wait_timeout_ms = 100;
    let cacher = start_cacher(flaky, &config, metrics);

    let err = cacher.list("pods/ns", &ListOptions::default()).await.unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(cacher.status().phase, ReflectorPhase::Initializing);
}

#[tokio::test]
async fn test_list_failures_are_retried() {
    let (store, _, metrics) = memory_store();
    let flaky = Arc::new(FlakyStorage::new(Arc::new(store)));
    flaky.list_failures.store(2, Ordering::SeqCst);
    let cacher = start_cacher(flaky.clone(), &test_storage_config(), metrics);

    cacher.ready().await.unwrap();
    assert_eq!(flaky.lists.load(Ordering::SeqCst), 3);
    assert_eq!(cacher.status().phase, ReflectorPhase::Synced);
}

#[tokio::test]
async fn test_stalled_list_times_out_and_is_retried() {
    let (store, _, metrics) = memory_store();
    let flaky = Arc::new(FlakyStorage::new(Arc::new(store)));
    flaky.stalled_lists.store(1, Ordering::SeqCst);
    let mut config = test_storage_config();
    config.retry.relist.timeout_ms = 50;
    let cacher = start_cacher(flaky.clone(), &config, metrics);

    cacher.ready().await.unwrap();
    assert_eq!(flaky.lists.load(Ordering::SeqCst), 2);
    assert_eq!(cacher.status().phase, ReflectorPhase::Synced);
}

#[tokio::test]
async fn test_abandoned_cache_closes_watchers_as_unreachable() {
    let (store, _, metrics) = memory_store();
    let store = Arc::new(store);
    let flaky = Arc::new(FlakyStorage::new(store.clone()));
    let mut config = test_storage_config();
    config.retry.relist.max_retries = 1;
    let cacher = start_cacher(flaky.clone(), &config, metrics.clone());
    cacher.ready().await.unwrap();

    let created = store.create("pods/ns/a", pod("ns", "a"), 0).await.unwrap();
    let mut watch = cacher.watch_list("pods/ns", &ListOptions::default()).await.unwrap();
    assert_eq!(next(&mut watch).await, WatchEvent::Added(created));

    flaky.list_failures.store(usize::MAX, Ordering::SeqCst);
    flaky.expire_watches();

    match next(&mut watch).await {
        WatchEvent::Error(e) => assert!(e.is_unreachable()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(timeout(Duration::from_secs(1), watch.recv()).await.unwrap().is_none());
    assert_eq!(cacher.status().phase, ReflectorPhase::Stopped);
    assert_eq!(cacher.watcher_count(), 0);
    assert_eq!(metrics.terminated_count("Pod", "unreachable"), 1);
}

#[tokio::test]
async fn test_watch_delivers_only_the_watched_key() {
    let f = fixture().await;
    let start = f.cacher.last_sync_resource_version().await.unwrap();
    let mut watch = f
        .cacher
        .watch("pods/ns/foo", &ListOptions::at(start.to_string()))
        .await
        .unwrap();

    f.store.create("pods/ns2/foo", pod("ns2", "foo"), 0).await.unwrap();
    let created = f.store.create("pods/ns/foo", pod("ns", "foo"), 0).await.unwrap();
    f.store.create("pods/ns/bar", pod("ns", "bar"), 0).await.unwrap();
    let updated = set_node(f.store.as_ref(), "pods/ns/foo", "fakeNode").await;

    assert_eq!(next(&mut watch).await, WatchEvent::Added(created.clone()));
    assert_eq!(next(&mut watch).await, WatchEvent::Modified(updated.clone()));

    // Resuming from the creation replays only the modification.
    let mut resumed = f
        .cacher
        .watch("pods/ns/foo", &ListOptions::at(created.metadata.resource_version.clone()))
        .await
        .unwrap();
    assert_eq!(next(&mut resumed).await, WatchEvent::Modified(updated.clone()));
    assert_quiet(&mut resumed, Duration::from_millis(100)).await;

    // From "now": current state first, then live changes.
    let mut now = f.cacher.watch("pods/ns/foo", &ListOptions::at("0")).await.unwrap();
    assert_eq!(next(&mut now).await, WatchEvent::Added(updated));
    let again = set_node(f.store.as_ref(), "pods/ns/foo", "anotherFakeNode").await;
    assert_eq!(next(&mut now).await, WatchEvent::Modified(again));
}

#[tokio::test]
async fn test_watch_filter_transitions() {
    let f = fixture().await;
    let filter = SelectionPredicate::new(LabelSelector::parse("filter=foo").unwrap(), FieldSelector::everything());

    f.store
        .create("pods/ns2/foo", with_labels(pod("ns2", "foo"), &[("filter", "foo")]), 0)
        .await
        .unwrap();
    let created = f
        .store
        .create("pods/ns/foo", with_labels(pod("ns", "foo"), &[("filter", "foo")]), 0)
        .await
        .unwrap();
    let relabel = |value: Option<&'static str>| {
        move |mut p: Pod, _: ResponseMeta| -> Result<(Pod, Option<u64>)> {
            match value {
                Some(v) => p.metadata.labels.insert("filter".into(), v.into()),
                None => p.metadata.labels.remove("filter"),
            };
            Ok((p, None))
        }
    };
    f.store.guaranteed_update("pods/ns/foo", false, None, &relabel(None)).await.unwrap();
    f.store.guaranteed_update("pods/ns/foo", false, None, &relabel(Some("foo"))).await.unwrap();
    set_node(f.store.as_ref(), "pods/ns/foo", "fakeNode").await;
    f.store.delete("pods/ns/foo", None).await.unwrap();

    let mut watch = f
        .cacher
        .watch(
            "pods/ns/foo",
            &ListOptions::at(created.metadata.resource_version.clone()).with_predicate(filter),
        )
        .await
        .unwrap();

    assert!(matches!(next(&mut watch).await, WatchEvent::Deleted(p) if p.metadata.labels.contains_key("filter")));
    assert!(matches!(next(&mut watch).await, WatchEvent::Added(_)));
    assert!(matches!(next(&mut watch).await, WatchEvent::Modified(p) if p.spec.node_name == "fakeNode"));
    assert!(matches!(next(&mut watch).await, WatchEvent::Deleted(p) if p.spec.node_name == "fakeNode"));
    assert_quiet(&mut watch, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_watch_ahead_of_cache_skips_older_events() {
    let f = fixture().await;
    let created = f.store.create("pods/ns/foo", pod("ns", "foo"), 0).await.unwrap();
    let start = rv(&created) + 10;

    let mut watch = f
        .cacher
        .watch("pods/ns/foo", &ListOptions::at(start.to_string()))
        .await
        .unwrap();
    for i in 0..11 {
        f.store
            .guaranteed_update("pods/ns/foo", false, None, &move |mut p: Pod, _: ResponseMeta| {
                p.spec.counter = i;
                Ok((p, None))
            })
            .await
            .unwrap();
    }

    match next(&mut watch).await {
        WatchEvent::Modified(p) => assert!(rv(&p) > start),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_watch_below_window_yields_too_old_error() {
    let mut config = test_storage_config();
    config.cacher.window_capacity = 2;
    let f = fixture_with(config).await;
    let mut last = 0;
    for i in 0..5 {
        last = rv(&f.store.create(&format!("pods/ns/p{i}"), pod("ns", &format!("p{i}")), 0).await.unwrap());
    }
    f.cacher.get("pods/ns/p0", &GetOptions::at(last.to_string())).await.unwrap();

    let mut watch = f.cacher.watch_list("pods/ns", &ListOptions::at("1")).await.unwrap();
    match next(&mut watch).await {
        WatchEvent::Error(e) => assert!(e.is_too_old_resource_version()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(timeout(Duration::from_secs(1), watch.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_watch_at_window_start_is_accepted() {
    let (store, _, metrics) = memory_store();
    let store = Arc::new(store);
    let mut last = 0;
    for i in 0..5 {
        last = rv(&store.create(&format!("pods/ns/p{i}"), pod("ns", &format!("p{i}")), 0).await.unwrap());
    }
    let cacher = start_cacher(store.clone(), &test_storage_config(), metrics);
    assert_eq!(cacher.last_sync_resource_version().await.unwrap(), last);

    let mut older = cacher.watch_list("pods/ns", &ListOptions::at((last - 1).to_string())).await.unwrap();
    assert!(matches!(next(&mut older).await, WatchEvent::Error(e) if e.is_too_old_resource_version()));

    let mut at_start = cacher.watch_list("pods/ns", &ListOptions::at(last.to_string())).await.unwrap();
    let mut ahead = cacher.watch_list("pods/ns", &ListOptions::at((last + 1).to_string())).await.unwrap();
    assert_quiet(&mut at_start, Duration::from_millis(200)).await;
    assert_quiet(&mut ahead, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_bookmarks_reach_opted_in_watchers() {
    let f = fixture().await;
    let current = f.cacher.last_sync_resource_version().await.unwrap();

    let mut plain = f.cacher.watch_list("pods/ns", &ListOptions::default()).await.unwrap();
    let mut opted = f
        .cacher
        .watch_list(
            "pods/ns",
            &ListOptions::default().with_predicate(SelectionPredicate::everything().with_bookmarks()),
        )
        .await
        .unwrap();

    assert_eq!(next(&mut opted).await, WatchEvent::Bookmark(current));
    assert_quiet(&mut plain, Duration::from_millis(200)).await;

    let created = f.store.create("pods/ns/foo", pod("ns", "foo"), 0).await.unwrap();
    let created_rv = rv(&created);
    loop {
        match next(&mut opted).await {
            WatchEvent::Bookmark(at) if at < created_rv => continue,
            WatchEvent::Added(p) => assert_eq!(p, created),
            other => panic!("unexpected {other:?}"),
        }
        break;
    }
    assert_eq!(next(&mut opted).await, WatchEvent::Bookmark(created_rv));
}

#[tokio::test]
async fn test_zero_bookmark_interval_still_ticks() {
    let mut config = test_storage_config();
    config.cacher.bookmark_interval_ms = 0;
    let f = fixture_with(config).await;
    let current = f.cacher.last_sync_resource_version().await.unwrap();

    let mut opted = f
        .cacher
        .watch_list(
            "pods/ns",
            &ListOptions::default().with_predicate(SelectionPredicate::everything().with_bookmarks()),
        )
        .await
        .unwrap();
    assert_eq!(next(&mut opted).await, WatchEvent::Bookmark(current));
}

/// Writes `count` updates while a separate task reads them off one watch
async fn burst_with_concurrent_reader(count: u64) {
    let f = fixture().await;
    let created = f.store.create("pods/ns/burst", pod("ns", "burst"), 0).await.unwrap();
    let mut watch = f
        .cacher
        .watch("pods/ns/burst", &ListOptions::at(created.metadata.resource_version.clone()))
        .await
        .unwrap();

    let reader = tokio::spawn(async move {
        let mut counters = Vec::new();
        while (counters.len() as u64) < count {
            match next(&mut watch).await {
                WatchEvent::Modified(p) => counters.push(p.spec.counter),
                other => panic!("unexpected {other:?}"),
            }
        }
        counters
    });
    for i in 1..=count {
        f.store
            .guaranteed_update("pods/ns/burst", false, None, &move |mut p: Pod, _: ResponseMeta| {
                p.spec.counter = i;
                Ok((p, None))
            })
            .await
            .unwrap();
    }

    assert_eq!(reader.await.unwrap(), (1..=count).collect::<Vec<_>>());
    assert_eq!(f.metrics.terminated_count("Pod", "overflow"), 0);
    assert_eq!(f.cacher.watcher_count(), 1);
}

#[tokio::test]
async fn test_write_burst_reaches_reading_watcher() {
    burst_with_concurrent_reader(50).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_burst_reaches_reading_watcher_multi_thread() {
    burst_with_concurrent_reader(50).await;
}

#[tokio::test]
async fn test_stopped_watch_yields_nothing_more() {
    let f = fixture().await;
    for i in 0..20 {
        let mut watch = f.cacher.watch_list("pods/ns", &ListOptions::default()).await.unwrap();
        watch.stop();
        let name = format!("p{i}");
        let created = f.store.create(&format!("pods/ns/{name}"), pod("ns", &name), 0).await.unwrap();
        f.cacher
            .get(&format!("pods/ns/{name}"), &GetOptions::at(created.metadata.resource_version))
            .await
            .unwrap();
        assert!(watch.recv().await.is_none());
    }
}

#[tokio::test]
async fn test_slow_watcher_does_not_stall_others() {
    let mut config = test_storage_config();
    config.cacher.input_queue_size = 2;
    config.cacher.output_queue_size = 1;
    let f = fixture_with(config).await;
    let start = f.cacher.last_sync_resource_version().await.unwrap().to_string();

    let mut idle = Vec::new();
    for _ in 0..20 {
        idle.push(f.cacher.watch_list("pods/ns", &ListOptions::at(start.clone())).await.unwrap());
    }
    let mut reading = f.cacher.watch_list("pods/ns", &ListOptions::at(start)).await.unwrap();

    for i in 1..=22 {
        let name = i.to_string();
        let created = f.store.create(&format!("pods/ns/{name}"), pod("ns", &name), 0).await.unwrap();
        assert_eq!(next(&mut reading).await, WatchEvent::Added(created));
    }

    assert_eq!(f.metrics.terminated_count("Pod", "overflow"), 20);
    assert_eq!(f.cacher.watcher_count(), 1);
    for mut watch in idle {
        while let Some(ev) = timeout(Duration::from_secs(1), watch.recv()).await.unwrap() {
            assert!(!ev.is_error());
        }
    }
}

#[tokio::test]
async fn test_relist_after_expired_watch_closes_stale_watchers() {
    let (store, _, metrics) = memory_store();
    let store = Arc::new(store);
    let flaky = Arc::new(FlakyStorage::new(store.clone()));
    let cacher = start_cacher(flaky.clone(), &test_storage_config(), metrics.clone());
    cacher.ready().await.unwrap();

    let created = store.create("pods/ns/a", pod("ns", "a"), 0).await.unwrap();
    let mut stale = cacher
        .watch_list("pods/ns", &ListOptions::default())
        .await
        .unwrap();
    let mut ahead = cacher
        .watch_list("pods/ns", &ListOptions::at("100"))
        .await
        .unwrap();
    assert_eq!(next(&mut stale).await, WatchEvent::Added(created.clone()));

    // Lose one event, then expire the reflector's watch.
    flaky.hold.store(true, Ordering::SeqCst);
    let missed = store.create("pods/ns/b", pod("ns", "b"), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    flaky.expire_watches();

    match next(&mut stale).await {
        WatchEvent::Error(e) => assert!(e.is_too_old_resource_version()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(timeout(Duration::from_secs(1), stale.recv()).await.unwrap().is_none());

    let got = cacher
        .get("pods/ns/b", &GetOptions::at(missed.metadata.resource_version.clone()))
        .await
        .unwrap();
    assert_eq!(got, missed);
    assert_eq!(flaky.lists.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.terminated_count("Pod", "too_old"), 1);
    assert_quiet(&mut ahead, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_stop_closes_watchers_and_reads() {
    let f = fixture().await;
    let mut watch = f.cacher.watch_list("pods/ns", &ListOptions::default()).await.unwrap();
    assert_eq!(f.cacher.watcher_count(), 1);

    f.cacher.stop();
    f.cacher.stop();

    assert!(timeout(Duration::from_secs(1), watch.recv()).await.unwrap().is_none());
    assert_eq!(f.cacher.watcher_count(), 0);
}

#[tokio::test]
async fn test_writes_are_routed_to_storage() {
    let f = fixture().await;
    f.cacher.create("pods/ns/foo", pod("ns", "foo"), 0).await.unwrap();
    let updated = set_node(&f.cacher, "pods/ns/foo", "n1").await;
    let deleted = f.cacher.delete("pods/ns/foo", None).await.unwrap();

    assert_eq!(updated.spec.node_name, "n1");
    assert!(rv(&deleted) > rv(&updated));
    assert_eq!(f.metrics.request_count("guaranteed_update", "Pod"), 1);
    assert!(f.store.get("pods/ns/foo", &GetOptions::default()).await.unwrap_err().is_not_found());
}
