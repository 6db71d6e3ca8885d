//! Active watch sessions of one cacher.
//!
//! Each session owns a bounded input queue and a task that filters and
//! forwards into the consumer's [`WatchHandle`]. Dispatch first uses
//! `try_send` under the window lock. Sessions found full get the rest of
//! the event's dispatch budget once the lock is released, and are closed
//! if their queue is still full when it runs out.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::event_window::WatchCacheEvent;
use crate::backend::WatchTarget;
use crate::object::SelectionPredicate;
use crate::object::StorageObject;
use crate::StorageError;
use crate::StorageMetrics;
use crate::WatchEvent;
use crate::WatchHandle;

#[derive(Debug)]
pub(crate) enum SessionInput<T> {
    Event(Arc<WatchCacheEvent<T>>),
    Bookmark(u64),
}

/// What a session is registered for
#[derive(Debug, Clone)]
pub(crate) struct SessionSpec {
    pub(crate) target: WatchTarget,
    pub(crate) predicate: SelectionPredicate,
    /// Events at or below this resourceVersion are not forwarded
    pub(crate) min_resource_version: u64,
    /// Resume point the session starts from
    pub(crate) cursor: u64,
}

struct SessionEntry<T> {
    target: WatchTarget,
    allow_bookmarks: bool,
    input: mpsc::Sender<SessionInput<T>>,
    /// Error delivered after the queue drains, set on forced closes
    terminal: oneshot::Sender<StorageError>,
    /// Highest resourceVersion handed to the session
    cursor: Arc<AtomicU64>,
    /// Set while an event waits for room in `input`
    pending: Arc<AtomicBool>,
}

/// A session whose input queue was full when the event was dispatched
struct BlockedSession<T> {
    id: u64,
    input: mpsc::Sender<SessionInput<T>>,
    cursor: Arc<AtomicU64>,
    pending: Arc<AtomicBool>,
}

/// Outcome of the non-blocking half of a dispatch
pub(crate) struct Dispatch<T> {
    event: Arc<WatchCacheEvent<T>>,
    blocked: Vec<BlockedSession<T>>,
}

impl<T> Dispatch<T> {
    pub(crate) fn is_complete(&self) -> bool {
        self.blocked.is_empty()
    }
}

enum Removal {
    Overflow,
    Gone,
}

pub(crate) struct WatcherRegistry<T> {
    kind: &'static str,
    sessions: Arc<DashMap<u64, SessionEntry<T>>>,
    next_id: AtomicU64,
    input_queue_size: usize,
    output_queue_size: usize,
    dispatch_timeout: Duration,
    metrics: Arc<StorageMetrics>,
}

impl<T: StorageObject> WatcherRegistry<T> {
    pub(crate) fn new(
        input_queue_size: usize,
        output_queue_size: usize,
        dispatch_timeout: Duration,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            kind: T::kind(),
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            input_queue_size: input_queue_size.max(1),
            output_queue_size: output_queue_size.max(1),
            dispatch_timeout,
            metrics,
        }
    }

    /// Registers a session that first forwards `replay`, then live input.
    ///
    /// The caller must hold the window read lock so no event can be
    /// dispatched between taking `replay` and registration.
    pub(crate) fn register(
        &self,
        spec: SessionSpec,
        replay: Vec<Arc<WatchCacheEvent<T>>>,
    ) -> WatchHandle<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (input_tx, input_rx) = mpsc::channel(self.input_queue_size);
        let (output_tx, output_rx) = mpsc::channel(self.output_queue_size);
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let cursor = Arc::new(AtomicU64::new(spec.cursor));
        let cancel = CancellationToken::new();

        self.sessions.insert(
            id,
            SessionEntry {
                target: spec.target.clone(),
                allow_bookmarks: spec.predicate.allow_watch_bookmarks,
                input: input_tx,
                terminal: terminal_tx,
                cursor: cursor.clone(),
                pending: Arc::new(AtomicBool::new(false)),
            },
        );
        self.metrics.watcher_added(self.kind);
        debug!(watcher_id = id, target = ?spec.target, replay = replay.len(), "watcher registered");

        let session = Session {
            id,
            spec,
            cursor,
            output: output_tx,
            cancel: cancel.clone(),
        };
        let sessions = self.sessions.clone();
        let metrics = self.metrics.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            session.run(replay, input_rx, terminal_rx).await;
            if sessions.remove(&id).is_some() {
                metrics.watcher_removed(kind);
            }
            trace!(watcher_id = id, "watcher session finished");
        });

        WatchHandle::new(output_rx, cancel)
    }

    /// Hands one ingested event to every session watching its key.
    ///
    /// Called under the window write lock; never blocks. Sessions with a
    /// full queue are returned for [`Self::finish`], which must run before
    /// the next event is dispatched.
    pub(crate) fn dispatch(
        &self,
        event: &Arc<WatchCacheEvent<T>>,
    ) -> Dispatch<T> {
        let mut removals = Vec::new();
        let mut blocked = Vec::new();
        for entry in self.sessions.iter() {
            if !entry.target.matches(&event.key) {
                continue;
            }
            match entry.input.try_send(SessionInput::Event(event.clone())) {
                Ok(()) => {
                    entry.cursor.fetch_max(event.resource_version, Ordering::AcqRel);
                }
                Err(TrySendError::Full(_)) => {
                    entry.pending.store(true, Ordering::Release);
                    blocked.push(BlockedSession {
                        id: *entry.key(),
                        input: entry.input.clone(),
                        cursor: entry.cursor.clone(),
                        pending: entry.pending.clone(),
                    });
                }
                Err(TrySendError::Closed(_)) => removals.push((*entry.key(), Removal::Gone)),
            }
        }
        self.metrics.event_dispatched(self.kind);
        self.apply_removals(removals);
        Dispatch {
            event: event.clone(),
            blocked,
        }
    }

    /// Waits, within the dispatch budget, for room in every queue that was
    /// full. Sessions still full when the budget runs out are closed.
    pub(crate) async fn finish(
        &self,
        dispatch: Dispatch<T>,
    ) {
        let Dispatch { event, blocked } = dispatch;
        let deadline = tokio::time::Instant::now() + self.dispatch_timeout;
        let mut removals = Vec::new();
        for session in blocked {
            let sent = tokio::time::timeout_at(
                deadline,
                session.input.send(SessionInput::Event(event.clone())),
            )
            .await;
            match sent {
                Ok(Ok(())) => {
                    session.cursor.fetch_max(event.resource_version, Ordering::AcqRel);
                }
                Ok(Err(_)) => removals.push((session.id, Removal::Gone)),
                Err(_) => removals.push((session.id, Removal::Overflow)),
            }
            session.pending.store(false, Ordering::Release);
        }
        self.apply_removals(removals);
    }

    /// Best-effort progress notice to every session that opted in
    pub(crate) fn bookmark(
        &self,
        resource_version: u64,
    ) {
        let mut removals = Vec::new();
        for entry in self.sessions.iter() {
            if !entry.allow_bookmarks
                || entry.pending.load(Ordering::Acquire)
                || entry.cursor.load(Ordering::Acquire) > resource_version
            {
                continue;
            }
            match entry.input.try_send(SessionInput::Bookmark(resource_version)) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => removals.push((*entry.key(), Removal::Gone)),
            }
        }
        self.apply_removals(removals);
    }

    /// Closes every session whose cursor predates `baseline` with `TooOld`
    pub(crate) fn terminate_stale(
        &self,
        baseline: u64,
    ) -> usize {
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|e| e.cursor.load(Ordering::Acquire) < baseline)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            if let Some((_, entry)) = self.sessions.remove(id) {
                let requested = entry.cursor.load(Ordering::Acquire);
                let _ = entry.terminal.send(StorageError::ResourceVersionTooOld {
                    requested,
                    oldest: baseline + 1,
                });
                self.metrics.watcher_removed(self.kind);
                self.metrics.watcher_terminated(self.kind, "too_old");
                debug!(watcher_id = id, requested, baseline, "watcher closed after relist");
            }
        }
        stale.len()
    }

    /// Closes every session with `err`, delivered after its queue drains
    pub(crate) fn terminate_all(
        &self,
        err: StorageError,
        reason: &str,
    ) -> usize {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                let _ = entry.terminal.send(err.clone());
                self.metrics.watcher_removed(self.kind);
                self.metrics.watcher_terminated(self.kind, reason);
                closed += 1;
            }
        }
        closed
    }

    /// Drains and closes every session
    pub(crate) fn close_all(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if self.sessions.remove(&id).is_some() {
                self.metrics.watcher_removed(self.kind);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    fn apply_removals(
        &self,
        removals: Vec<(u64, Removal)>,
    ) {
        for (id, reason) in removals {
            if self.sessions.remove(&id).is_none() {
                continue;
            }
            self.metrics.watcher_removed(self.kind);
            if let Removal::Overflow = reason {
                self.metrics.watcher_terminated(self.kind, "overflow");
                warn!(watcher_id = id, "watcher queue full, closing slow watcher");
            }
        }
    }
}

/// Consumer-side half of a session
struct Session<T> {
    id: u64,
    spec: SessionSpec,
    cursor: Arc<AtomicU64>,
    output: mpsc::Sender<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T: StorageObject> Session<T> {
    async fn run(
        self,
        replay: Vec<Arc<WatchCacheEvent<T>>>,
        mut input: mpsc::Receiver<SessionInput<T>>,
        mut terminal: oneshot::Receiver<StorageError>,
    ) {
        for event in replay {
            if !self.forward_event(&event).await {
                return;
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    trace!(watcher_id = self.id, "watcher stopped by consumer");
                    return;
                }
                next = input.recv() => next,
            };
            let delivered = match next {
                Some(SessionInput::Event(event)) => self.forward_event(&event).await,
                Some(SessionInput::Bookmark(rv)) => self.send(WatchEvent::Bookmark(rv)).await,
                // Producer dropped the session after everything queued was read.
                None => break,
            };
            if !delivered {
                return;
            }
        }

        if let Ok(err) = terminal.try_recv() {
            let _ = self.send(WatchEvent::Error(err)).await;
        }
    }

    async fn forward_event(
        &self,
        event: &WatchCacheEvent<T>,
    ) -> bool {
        if event.resource_version <= self.spec.min_resource_version {
            return true;
        }
        match event.filtered(&self.spec.predicate) {
            Some(out) => self.send(out).await,
            None => true,
        }
    }

    /// `false` once the consumer is gone
    async fn send(
        &self,
        event: WatchEvent<T>,
    ) -> bool {
        let rv = match &event {
            WatchEvent::Bookmark(rv) => Some(*rv),
            _ => None,
        };
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.output.send(event) => res.is_ok(),
        };
        if let (true, Some(rv)) = (sent, rv) {
            self.cursor.fetch_max(rv, Ordering::AcqRel);
        }
        sent
    }
}
