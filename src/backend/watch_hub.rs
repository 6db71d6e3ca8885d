//! Live fan-out of backend events.
//!
//! Writers publish under their write lock so the broadcast order is the
//! revision order. A watcher subscribes first and reads history second;
//! live events at or below what history already delivered are skipped.
//! A watcher that lags behind the broadcast ring recovers from retained
//! history, or reports compaction when that history is gone.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::BackendEvent;
use super::BackendResult;
use super::BackendWatch;
use super::WatchTarget;

/// Consistent view of retained history
pub(crate) struct History {
    /// Events with revision in `[from, current]`
    pub events: Vec<BackendEvent>,
    pub current: u64,
}

pub(crate) trait EventSource: Send + Sync + 'static {
    /// Retained events from revision `from`, `0` meaning "none, just the
    /// current revision". Fails with `Compacted` when `from` is gone.
    fn history_since(
        &self,
        from: u64,
    ) -> BackendResult<History>;
}

pub(crate) struct WatchHub {
    sender: broadcast::Sender<Arc<BackendEvent>>,
    watcher_buffer: usize,
}

impl WatchHub {
    pub(crate) fn new(
        capacity: usize,
        watcher_buffer: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            watcher_buffer: watcher_buffer.max(1),
        }
    }

    /// Must be called while the writer still holds its lock
    pub(crate) fn publish(
        &self,
        event: BackendEvent,
    ) {
        // No subscribers is fine.
        let _ = self.sender.send(Arc::new(event));
    }

    pub(crate) fn watch(
        &self,
        source: Arc<dyn EventSource>,
        target: WatchTarget,
        start_revision: u64,
    ) -> BackendWatch {
        let live = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(self.watcher_buffer);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(?target, "backend watch cancelled");
                }
                _ = pump(source, live, &target, start_revision, tx) => {
                    trace!(?target, "backend watch finished");
                }
            }
        });

        BackendWatch::new(rx, cancel)
    }
}

async fn pump(
    source: Arc<dyn EventSource>,
    mut live: broadcast::Receiver<Arc<BackendEvent>>,
    target: &WatchTarget,
    start_revision: u64,
    tx: mpsc::Sender<BackendResult<BackendEvent>>,
) {
    let mut next = start_revision;
    match backfill(source.as_ref(), target, &mut next, &tx).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    }

    loop {
        match live.recv().await {
            Ok(event) => {
                if event.revision < next {
                    continue;
                }
                next = event.revision + 1;
                if target.matches(event.key()) && tx.send(Ok((*event).clone())).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, next, "backend watcher lagged, replaying history");
                match backfill(source.as_ref(), target, &mut next, &tx).await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Sends retained events from `*next` and advances it past the current
/// revision. `Ok(false)` when the receiver is gone.
async fn backfill(
    source: &dyn EventSource,
    target: &WatchTarget,
    next: &mut u64,
    tx: &mpsc::Sender<BackendResult<BackendEvent>>,
) -> BackendResult<bool> {
    let history = source.history_since(*next)?;
    for event in history.events {
        if event.revision < *next || !target.matches(event.key()) {
            continue;
        }
        if tx.send(Ok(event)).await.is_err() {
            return Ok(false);
        }
    }
    *next = (*next).max(history.current + 1);
    Ok(true)
}
