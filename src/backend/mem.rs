use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;

use super::engine::scan_start;
use super::engine::take_page;
use super::BackendEvent;
use super::BackendResult;
use super::EventKind;
use super::KeyValue;
use super::MvccEngine;
use super::Tables;
use super::TtlIndex;
use crate::config::BackendConfig;

/// In-memory MVCC store
pub type MemoryBackend = MvccEngine<MemoryTables>;

#[derive(Debug, Default)]
pub struct MemoryTables {
    data: BTreeMap<String, KeyValue>,
    /// Contiguous by revision
    events: VecDeque<BackendEvent>,
}

impl MvccEngine<MemoryTables> {
    pub fn new() -> Self {
        Self::with_config(&BackendConfig::default())
    }

    pub fn with_config(config: &BackendConfig) -> Self {
        Self::assemble(MemoryTables::default(), 0, 0, TtlIndex::new(), config)
    }
}

impl Default for MvccEngine<MemoryTables> {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables for MemoryTables {
    fn load_revisions(&self) -> BackendResult<(u64, u64)> {
        Ok((0, 0))
    }

    fn get(
        &self,
        key: &str,
    ) -> BackendResult<Option<KeyValue>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: Option<usize>,
    ) -> BackendResult<(Vec<KeyValue>, bool)> {
        let iter = self
            .data
            .range::<str, _>((scan_start(prefix, start_after), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| Ok(kv.clone()));
        take_page(iter, limit)
    }

    fn apply(
        &mut self,
        event: &BackendEvent,
    ) -> BackendResult<()> {
        match event.kind {
            EventKind::Put => {
                self.data.insert(event.kv.key.clone(), event.kv.clone());
            }
            EventKind::Delete => {
                self.data.remove(&event.kv.key);
            }
        }
        self.events.push_back(event.clone());
        Ok(())
    }

    fn events(
        &self,
        from: u64,
        to: u64,
    ) -> BackendResult<Vec<BackendEvent>> {
        let start = self.events.partition_point(|e| e.revision < from);
        Ok(self
            .events
            .iter()
            .skip(start)
            .take_while(|e| e.revision <= to)
            .cloned()
            .collect())
    }

    fn compact(
        &mut self,
        revision: u64,
    ) -> BackendResult<()> {
        while self.events.front().is_some_and(|e| e.revision <= revision) {
            self.events.pop_front();
        }
        Ok(())
    }

    fn deadlines(&self) -> BackendResult<Vec<(String, u64)>> {
        Ok(self
            .data
            .values()
            .filter_map(|kv| kv.expires_at_ms.map(|d| (kv.key.clone(), d)))
            .collect())
    }
}
