//! The storage contract shared by [`crate::KvStore`] and [`crate::Cacher`].
//!
//! Callers receive results by value; cancellation is dropping the future and
//! deadlines are explicit durations in [`ListOptions`].

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::object::ObjectList;
use crate::object::SelectionPredicate;
use crate::object::StorageObject;
use crate::Result;
use crate::StorageError;
use crate::Versioner;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Return `T::default()` instead of `NotFound`
    pub ignore_not_found: bool,
    pub resource_version: String,
}

impl GetOptions {
    pub fn ignore_not_found() -> Self {
        Self {
            ignore_not_found: true,
            ..Default::default()
        }
    }

    pub fn at(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: resource_version.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// `""`/`"0"` for latest; otherwise a point the read must reflect
    pub resource_version: String,
    pub predicate: SelectionPredicate,
    /// Page size, `None` for everything
    pub limit: Option<usize>,
    /// Key after which the next page starts
    pub continue_token: Option<String>,
    /// Upper bound on waiting for a future resourceVersion
    pub timeout: Option<Duration>,
}

impl ListOptions {
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: resource_version.into(),
            ..Default::default()
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: SelectionPredicate,
    ) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_continue(
        mut self,
        token: impl Into<String>,
    ) -> Self {
        self.continue_token = Some(token.into());
        self
    }

    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.continue_token.is_some()
    }
}

/// Checks attached to delete and update calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            resource_version: None,
        }
    }

    pub fn resource_version(resource_version: impl Into<String>) -> Self {
        Self {
            uid: None,
            resource_version: Some(resource_version.into()),
        }
    }

    pub fn check<T: StorageObject>(
        &self,
        key: &str,
        obj: &T,
    ) -> Result<()> {
        let meta = obj.metadata();
        if let Some(uid) = &self.uid {
            if *uid != meta.uid {
                return Err(StorageError::precondition_failed(
                    key,
                    format!("UID in precondition: {uid}, UID in object meta: {}", meta.uid),
                )
                .into());
            }
        }
        if let Some(rv) = &self.resource_version {
            if *rv != meta.resource_version {
                return Err(StorageError::precondition_failed(
                    key,
                    format!(
                        "ResourceVersion in precondition: {rv}, ResourceVersion in object meta: {}",
                        meta.resource_version
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// State passed to the update function of `guaranteed_update`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Seconds until expiry, `0` when the key has no TTL
    pub ttl: i64,
    /// Modify revision of the current state, `0` when absent
    pub resource_version: u64,
}

/// `(current, meta) -> (desired, ttl)`.
///
/// May be called several times for one update and must not have side
/// effects. A `None` ttl keeps the current remaining TTL.
pub type UpdateFn<T> = dyn Fn(T, ResponseMeta) -> Result<(T, Option<u64>)> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker carrying only a resourceVersion
    Bookmark(u64),
    /// Terminal error, the stream ends after it
    Error(StorageError),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                Some(obj)
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }

    pub fn is_bookmark(&self) -> bool {
        matches!(self, WatchEvent::Bookmark(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WatchEvent::Error(_))
    }
}

impl<T: StorageObject> WatchEvent<T> {
    /// resourceVersion carried by the event, `None` for errors
    pub fn resource_version(&self) -> Option<u64> {
        match self {
            WatchEvent::Bookmark(rv) => Some(*rv),
            WatchEvent::Error(_) => None,
            _ => self
                .object()
                .and_then(|obj| Versioner.object_resource_version(obj).ok()),
        }
    }
}

/// Consumer side of a watch.
///
/// `stop()` is idempotent and dropping the handle stops it too. Producers
/// observe the cancellation and release their resources.
pub struct WatchHandle<T> {
    events: ReceiverStream<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T> std::fmt::Debug for WatchHandle<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> WatchHandle<T> {
    pub fn new(
        receiver: mpsc::Receiver<WatchEvent<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events: ReceiverStream::new(receiver),
            cancel,
        }
    }

    /// A handle that yields `err` once and then ends
    pub fn closed_with(err: StorageError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh receiver: cannot fail.
        let _ = tx.try_send(WatchEvent::Error(err));
        Self::new(rx, CancellationToken::new())
    }

    /// Next event, `None` once the stream has ended or `stop()` was called
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.events.next().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Stream for WatchHandle<T> {
    type Item = WatchEvent<T>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait Storage<T: StorageObject>: Send + Sync + 'static {
    fn versioner(&self) -> &Versioner;

    /// Fails with `AlreadyExists` when the key is occupied. `ttl == 0`
    /// means no expiry.
    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: u64,
    ) -> Result<T>;

    /// Returns the deleted object
    async fn delete(
        &self,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> Result<T>;

    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<T>;

    /// Single key read shaped as a list; an absent key yields an empty list
    async fn get_to_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>>;

    async fn list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<T>>;

    /// Watches a single key
    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>>;

    /// Watches every key under the `key` directory
    async fn watch_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchHandle<T>>;

    /// Atomic read-modify-write, retried until the compare-and-swap wins
    async fn guaranteed_update(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&Preconditions>,
        try_update: &UpdateFn<T>,
    ) -> Result<T>;
}
