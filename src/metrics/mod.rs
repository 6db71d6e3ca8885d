//! Instance-owned prometheus metrics.
//!
//! One [`StorageMetrics`] is built at startup and shared as an `Arc` by
//! every store and cacher. Names are prefixed `storage_`.


use std::time::Duration;

use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

use crate::Result;
use crate::StorageError;

const NAMESPACE: &str = "storage";

#[derive(Debug, Clone)]
pub struct StorageMetrics {
    registry: Registry,

    request_total: IntCounterVec,
    request_errors: IntCounterVec,
    request_latency: HistogramVec,
    decode_errors: IntCounterVec,
    decode_cache: IntCounterVec,

    active_watchers: IntGaugeVec,
    dispatched_events: IntCounterVec,
    terminated_watchers: IntCounterVec,
    window_size: IntGaugeVec,
    relists: IntCounterVec,
}

impl StorageMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let request_total = IntCounterVec::new(
            Opts::new("requests_total", "Storage requests by operation and type"),
            &["operation", "type"],
        )?;
        let request_errors = IntCounterVec::new(
            Opts::new("request_errors_total", "Failed storage requests by operation and type"),
            &["operation", "type"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Storage request latency")
                .buckets(exponential_buckets(0.0005, 2.0, 16)?),
            &["operation", "type"],
        )?;
        let decode_errors = IntCounterVec::new(
            Opts::new("decode_errors_total", "Objects that failed to decode"),
            &["type"],
        )?;
        let decode_cache = IntCounterVec::new(
            Opts::new("decode_cache_total", "Decode cache lookups by result"),
            &["type", "result"],
        )?;
        let active_watchers = IntGaugeVec::new(
            Opts::new("cacher_active_watchers", "Registered watch cache sessions"),
            &["type"],
        )?;
        let dispatched_events = IntCounterVec::new(
            Opts::new("cacher_dispatched_events_total", "Events ingested by the watch cache"),
            &["type"],
        )?;
        let terminated_watchers = IntCounterVec::new(
            Opts::new("cacher_terminated_watchers_total", "Sessions closed by the producer"),
            &["type", "reason"],
        )?;
        let window_size = IntGaugeVec::new(
            Opts::new("cacher_window_size", "Events currently held in the watch cache window"),
            &["type"],
        )?;
        let relists = IntCounterVec::new(
            Opts::new("cacher_relists_total", "Reflector list operations"),
            &["type"],
        )?;

        registry.register(Box::new(request_total.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(decode_cache.clone()))?;
        registry.register(Box::new(active_watchers.clone()))?;
        registry.register(Box::new(dispatched_events.clone()))?;
        registry.register(Box::new(terminated_watchers.clone()))?;
        registry.register(Box::new(window_size.clone()))?;
        registry.register(Box::new(relists.clone()))?;

        Ok(Self {
            registry,
            request_total,
            request_errors,
            request_latency,
            decode_errors,
            decode_cache,
            active_watchers,
            dispatched_events,
            terminated_watchers,
            window_size,
            relists,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric in this instance
    pub fn gather(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| StorageError::Internal(e.to_string()).into())
    }

    pub fn observe_request(
        &self,
        operation: &str,
        kind: &str,
        elapsed: Duration,
        success: bool,
    ) {
        let labels = [operation, kind];
        self.request_total.with_label_values(&labels).inc();
        if !success {
            self.request_errors.with_label_values(&labels).inc();
        }
        self.request_latency
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn decode_error(
        &self,
        kind: &str,
    ) {
        self.decode_errors.with_label_values(&[kind]).inc();
    }

    pub fn decode_cache_lookup(
        &self,
        kind: &str,
        hit: bool,
    ) {
        let result = if hit { "hit" } else { "miss" };
        self.decode_cache.with_label_values(&[kind, result]).inc();
    }

    pub fn watcher_added(
        &self,
        kind: &str,
    ) {
        self.active_watchers.with_label_values(&[kind]).inc();
    }

    pub fn watcher_removed(
        &self,
        kind: &str,
    ) {
        self.active_watchers.with_label_values(&[kind]).dec();
    }

    pub fn watcher_terminated(
        &self,
        kind: &str,
        reason: &str,
    ) {
        self.terminated_watchers.with_label_values(&[kind, reason]).inc();
    }

    pub fn event_dispatched(
        &self,
        kind: &str,
    ) {
        self.dispatched_events.with_label_values(&[kind]).inc();
    }

    pub fn set_window_size(
        &self,
        kind: &str,
        size: usize,
    ) {
        self.window_size.with_label_values(&[kind]).set(size as i64);
    }

    pub fn relisted(
        &self,
        kind: &str,
    ) {
        self.relists.with_label_values(&[kind]).inc();
    }

    pub fn active_watchers(
        &self,
        kind: &str,
    ) -> i64 {
        self.active_watchers.with_label_values(&[kind]).get()
    }

    pub fn request_count(
        &self,
        operation: &str,
        kind: &str,
    ) -> u64 {
        self.request_total.with_label_values(&[operation, kind]).get()
    }

    pub fn request_error_count(
        &self,
        operation: &str,
        kind: &str,
    ) -> u64 {
        self.request_errors.with_label_values(&[operation, kind]).get()
    }

    pub fn decode_cache_count(
        &self,
        kind: &str,
        hit: bool,
    ) -> u64 {
        let result = if hit { "hit" } else { "miss" };
        self.decode_cache.with_label_values(&[kind, result]).get()
    }

    pub fn terminated_count(
        &self,
        kind: &str,
        reason: &str,
    ) -> u64 {
        self.terminated_watchers.with_label_values(&[kind, reason]).get()
    }
}
