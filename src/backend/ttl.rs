//! Key expiry index.
//!
//! Two-way index: deadline -> keys for cheap "what expired" scans and
//! key -> deadline for cancellation on overwrite or delete. Deadlines are
//! wall clock unix milliseconds so they can be persisted with the entry.
//! Engines check it lazily on each operation; [`spawn_ttl_sweeper`] adds
//! a periodic purge for idle stores.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::now_ms;
use super::KvBackend;

#[derive(Debug, Default)]
pub struct TtlIndex {
    expirations: BTreeMap<u64, Vec<String>>,
    key_to_expiry: HashMap<String, u64>,
}

impl TtlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `ttl_secs` from now
    pub fn deadline_after(ttl_secs: u64) -> u64 {
        now_ms().saturating_add(ttl_secs.saturating_mul(1000))
    }

    /// Sets or replaces the deadline of `key`
    pub fn register(
        &mut self,
        key: &str,
        expires_at_ms: u64,
    ) {
        self.unregister(key);
        self.expirations.entry(expires_at_ms).or_default().push(key.to_string());
        self.key_to_expiry.insert(key.to_string(), expires_at_ms);
    }

    pub fn unregister(
        &mut self,
        key: &str,
    ) {
        if let Some(expires_at) = self.key_to_expiry.remove(key) {
            if let Some(keys) = self.expirations.get_mut(&expires_at) {
                keys.retain(|k| k != key);
                if keys.is_empty() {
                    self.expirations.remove(&expires_at);
                }
            }
        }
    }

    /// Removes and returns every key due at or before `now_ms`
    pub fn take_expired(
        &mut self,
        now_ms: u64,
    ) -> Vec<String> {
        let due: Vec<u64> = self.expirations.range(..=now_ms).map(|(t, _)| *t).collect();
        let mut expired = Vec::new();
        for time in due {
            if let Some(keys) = self.expirations.remove(&time) {
                for key in &keys {
                    self.key_to_expiry.remove(key);
                }
                expired.extend(keys);
            }
        }
        expired
    }

    pub fn may_have_expired(
        &self,
        now_ms: u64,
    ) -> bool {
        self.expirations.keys().next().is_some_and(|first| *first <= now_ms)
    }

    pub fn deadline(
        &self,
        key: &str,
    ) -> Option<u64> {
        self.key_to_expiry.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.key_to_expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_expiry.is_empty()
    }
}

/// Periodically purges expired keys until `shutdown` is cancelled
pub fn spawn_ttl_sweeper(
    backend: Arc<dyn KvBackend>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("ttl sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match backend.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!(expired = n, "purged expired keys"),
                        Err(e) => warn!(error = %e, "ttl sweep failed"),
                    }
                }
            }
        }
    })
}
