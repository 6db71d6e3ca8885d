use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::Mutex;

/// Decoded objects keyed by backend mod revision.
///
/// A revision names exactly one write of one key, so an entry never goes
/// stale. Full capacity evicts the oldest insertion.
#[derive(Debug)]
pub(crate) struct DecodeCache<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<u64, T>,
    order: VecDeque<u64>,
}

impl<T: Clone> DecodeCache<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub(crate) fn get(
        &self,
        revision: u64,
    ) -> Option<T> {
        self.inner.lock().entries.get(&revision).cloned()
    }

    pub(crate) fn insert(
        &self,
        revision: u64,
        obj: T,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.insert(revision, obj).is_some() {
            return;
        }
        inner.order.push_back(revision);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
