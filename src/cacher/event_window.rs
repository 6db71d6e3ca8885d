//! Recent mutations plus the latest state they produced.
//!
//! The window holds every event with a resourceVersion in
//! `(start_revision, resource_version]`. Evicting the oldest event moves
//! `start_revision` up to it, so the held suffix never has gaps.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use crate::backend::WatchTarget;
use crate::object::SelectionPredicate;
use crate::object::StorageObject;
use crate::StorageError;
use crate::WatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WatchCacheEvent<T> {
    pub(crate) kind: CacheEventKind,
    pub(crate) key: String,
    /// The new state, or for deletes the removed object
    pub(crate) object: T,
    pub(crate) prev_object: Option<T>,
    pub(crate) resource_version: u64,
}

impl<T: StorageObject> WatchCacheEvent<T> {
    /// Synthetic `Added` used to replay current state
    pub(crate) fn added(
        key: String,
        object: T,
        resource_version: u64,
    ) -> Self {
        Self {
            kind: CacheEventKind::Added,
            key,
            object,
            prev_object: None,
            resource_version,
        }
    }

    /// The event as seen through `predicate`, `None` if it is invisible
    pub(crate) fn filtered(
        &self,
        predicate: &SelectionPredicate,
    ) -> Option<WatchEvent<T>> {
        if self.kind == CacheEventKind::Deleted {
            return predicate
                .matches(&self.object)
                .then(|| WatchEvent::Deleted(self.object.clone()));
        }
        let cur_passes = predicate.matches(&self.object);
        match &self.prev_object {
            None => cur_passes.then(|| WatchEvent::Added(self.object.clone())),
            Some(prev) => match (predicate.matches(prev), cur_passes) {
                (true, true) => Some(WatchEvent::Modified(self.object.clone())),
                (false, true) => Some(WatchEvent::Added(self.object.clone())),
                (true, false) => {
                    // Leaving the selection reads as a delete at this revision.
                    let mut gone = prev.clone();
                    crate::Versioner.update_object(&mut gone, self.resource_version);
                    Some(WatchEvent::Deleted(gone))
                }
                (false, false) => None,
            },
        }
    }
}

#[derive(Debug)]
pub(crate) struct EventWindow<T> {
    capacity: usize,
    events: VecDeque<Arc<WatchCacheEvent<T>>>,
    start_revision: u64,
    resource_version: u64,
    store: BTreeMap<String, T>,
}

impl<T: StorageObject> EventWindow<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            start_revision: 0,
            resource_version: 0,
            store: BTreeMap::new(),
        }
    }

    /// Resets to a listed snapshot taken at `resource_version`
    pub(crate) fn replace(
        &mut self,
        items: Vec<(String, T)>,
        resource_version: u64,
    ) {
        self.events.clear();
        self.store = items.into_iter().collect();
        self.start_revision = resource_version;
        self.resource_version = resource_version;
    }

    /// Applies one watch event for `key`.
    ///
    /// Events at or below the current resourceVersion were already applied
    /// and yield `None`.
    pub(crate) fn process(
        &mut self,
        key: String,
        event: WatchEvent<T>,
    ) -> Option<Arc<WatchCacheEvent<T>>> {
        let resource_version = event.resource_version()?;
        if resource_version <= self.resource_version {
            return None;
        }

        let (kind, object, prev_object) = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let prev = self.store.insert(key.clone(), obj.clone());
                let kind = if prev.is_some() {
                    CacheEventKind::Modified
                } else {
                    CacheEventKind::Added
                };
                (kind, obj, prev)
            }
            WatchEvent::Deleted(obj) => {
                let prev = self.store.remove(&key);
                (CacheEventKind::Deleted, obj, prev)
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return None,
        };

        let event = Arc::new(WatchCacheEvent {
            kind,
            key,
            object,
            prev_object,
            resource_version,
        });
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                self.start_revision = evicted.resource_version;
            }
        }
        self.resource_version = resource_version;
        Some(event)
    }

    /// Buffered events after `resource_version` within `target`
    pub(crate) fn since(
        &self,
        resource_version: u64,
        target: &WatchTarget,
    ) -> Result<Vec<Arc<WatchCacheEvent<T>>>, StorageError> {
        self.check_not_too_old(resource_version)?;
        let start = self
            .events
            .partition_point(|e| e.resource_version <= resource_version);
        Ok(self
            .events
            .iter()
            .skip(start)
            .filter(|e| target.matches(&e.key))
            .cloned()
            .collect())
    }

    pub(crate) fn check_not_too_old(
        &self,
        resource_version: u64,
    ) -> Result<(), StorageError> {
        if resource_version < self.start_revision {
            return Err(StorageError::ResourceVersionTooOld {
                requested: resource_version,
                oldest: self.start_revision + 1,
            });
        }
        Ok(())
    }

    pub(crate) fn get(
        &self,
        key: &str,
    ) -> Option<&T> {
        self.store.get(key)
    }

    /// Current objects within `target`, in key order
    pub(crate) fn objects(
        &self,
        target: &WatchTarget,
    ) -> Vec<(&String, &T)> {
        match target {
            WatchTarget::Key(key) => self.store.get_key_value(key.as_str()).into_iter().collect(),
            WatchTarget::Prefix(prefix) => self
                .store
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .collect(),
        }
    }

    pub(crate) fn resource_version(&self) -> u64 {
        self.resource_version
    }

    pub(crate) fn start_revision(&self) -> u64 {
        self.start_revision
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}
