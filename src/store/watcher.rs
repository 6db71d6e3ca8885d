//! Decoding and filtering of a backend watch.
//!
//! | prev passes | cur passes | emitted |
//! |---|---|---|
//! | none (create) | yes | `Added(cur)` |
//! | yes | yes | `Modified(cur)` |
//! | no | yes | `Added(cur)` |
//! | yes | no | `Deleted(prev)` at the event revision |
//! | delete, prev passes | | `Deleted(prev)` at the event revision |

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::to_storage_err;
use super::ObjectDecoder;
use crate::backend::BackendEvent;
use crate::backend::BackendWatch;
use crate::backend::EventKind;
use crate::object::SelectionPredicate;
use crate::object::StorageObject;
use crate::Error;
use crate::Result;
use crate::StorageError;
use crate::WatchEvent;
use crate::WatchHandle;

/// Applies the filter transition table to one backend event
pub(crate) fn translate<T: StorageObject>(
    decoder: &ObjectDecoder<T>,
    predicate: &SelectionPredicate,
    event: &BackendEvent,
) -> Result<Option<WatchEvent<T>>> {
    let prev = match &event.prev_kv {
        Some(kv) => Some(decoder.decode(&kv.value, event.revision)?),
        None => None,
    };

    let emitted = match event.kind {
        EventKind::Delete => prev.filter(|p| predicate.matches(p)).map(WatchEvent::Deleted),
        EventKind::Put => {
            let cur = decoder.decode(&event.kv.value, event.revision)?;
            let cur_passes = predicate.matches(&cur);
            match prev {
                None => cur_passes.then_some(WatchEvent::Added(cur)),
                Some(prev) => match (predicate.matches(&prev), cur_passes) {
                    (true, true) => Some(WatchEvent::Modified(cur)),
                    (false, true) => Some(WatchEvent::Added(cur)),
                    (true, false) => Some(WatchEvent::Deleted(prev)),
                    (false, false) => None,
                },
            }
        }
    };
    Ok(emitted)
}

/// Forwards `initial` as `Added` and then every translated backend event
pub(crate) fn spawn_watch<T: StorageObject>(
    key: String,
    backend_watch: BackendWatch,
    decoder: ObjectDecoder<T>,
    predicate: SelectionPredicate,
    initial: Vec<T>,
    buffer: usize,
) -> WatchHandle<T> {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                trace!(key = %key, "watch stopped by consumer");
            }
            _ = forward(&key, backend_watch, &decoder, &predicate, initial, &tx) => {
                trace!(key = %key, "watch stream ended");
            }
        }
    });

    WatchHandle::new(rx, cancel)
}

async fn forward<T: StorageObject>(
    key: &str,
    mut backend_watch: BackendWatch,
    decoder: &ObjectDecoder<T>,
    predicate: &SelectionPredicate,
    initial: Vec<T>,
    tx: &mpsc::Sender<WatchEvent<T>>,
) {
    for obj in initial {
        if tx.send(WatchEvent::Added(obj)).await.is_err() {
            return;
        }
    }

    while let Some(item) = backend_watch.recv().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                debug!(key = %key, error = %e, "backend watch failed");
                let _ = tx.send(WatchEvent::Error(to_storage_err(e, key, 0))).await;
                return;
            }
        };
        match translate(decoder, predicate, &event) {
            Ok(Some(out)) => {
                if tx.send(out).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %event.kv.key, revision = event.revision, error = %e, "failed to decode watch event");
                let _ = tx.send(WatchEvent::Error(storage_error(e))).await;
                return;
            }
        }
    }
}

fn storage_error(e: Error) -> StorageError {
    match e {
        Error::Storage(e) => e,
        other => StorageError::Internal(other.to_string()),
    }
}
