//! Durable tables on sled.
//!
//! - `data`: key -> bincode [`KeyValue`]
//! - `events`: big-endian revision -> bincode [`BackendEvent`]
//! - `meta`: `revision` and `compacted` as big-endian `u64`
//!
//! One event is one sled transaction across the three trees.

use std::ops::Bound;
use std::path::Path;

use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError;
use sled::Batch;
use sled::Db;
use sled::IVec;
use sled::Transactional;
use sled::Tree;
use tracing::error;
use tracing::info;

use super::engine::take_page;
use super::BackendError;
use super::BackendEvent;
use super::BackendResult;
use super::EventKind;
use super::KeyValue;
use super::MvccEngine;
use super::Tables;
use crate::config::BackendConfig;

const DATA_TREE: &str = "data";
const EVENTS_TREE: &str = "events";
const META_TREE: &str = "meta";
const REVISION_KEY: &[u8] = b"revision";
const COMPACTED_KEY: &[u8] = b"compacted";

/// Durable MVCC store
pub type SledBackend = MvccEngine<SledTables>;

impl From<sled::Error> for BackendError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => BackendError::Corrupted(e.to_string()),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

impl From<bincode::Error> for BackendError {
    fn from(e: bincode::Error) -> Self {
        BackendError::Corrupted(e.to_string())
    }
}

pub struct SledTables {
    db: Db,
    data: Tree,
    events: Tree,
    meta: Tree,
}

impl std::fmt::Debug for SledTables {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledTables").field("data_len", &self.data.len()).finish()
    }
}

impl SledTables {
    pub fn new(db: Db) -> BackendResult<Self> {
        let data = db.open_tree(DATA_TREE)?;
        let events = db.open_tree(EVENTS_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self {
            db,
            data,
            events,
            meta,
        })
    }

    pub fn flush(&self) -> BackendResult<usize> {
        Ok(self.db.flush()?)
    }

    fn read_u64(
        &self,
        key: &[u8],
    ) -> BackendResult<u64> {
        match self.meta.get(key)? {
            Some(v) => Ok(key_to_revision(&v)?),
            None => Ok(0),
        }
    }
}

impl Drop for SledTables {
    fn drop(&mut self) {
        match self.db.flush() {
            Ok(_) => info!("Successfully flushed sled backend"),
            Err(e) => error!(?e, "Failed to flush sled backend"),
        }
    }
}

impl MvccEngine<SledTables> {
    /// Opens (or creates) the database at `config.sled_path`
    pub fn open_at(config: &BackendConfig) -> BackendResult<Self> {
        Self::open_path(&config.sled_path, config)
    }

    pub fn open_path(
        path: impl AsRef<Path>,
        config: &BackendConfig,
    ) -> BackendResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .use_compression(config.sled_compression)
            .open()?;
        Self::open(SledTables::new(db)?, config)
    }
}

pub(crate) fn revision_to_key(revision: u64) -> [u8; 8] {
    revision.to_be_bytes()
}

pub(crate) fn key_to_revision(key: &[u8]) -> BackendResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| BackendError::Corrupted(format!("invalid revision key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_kv(value: &IVec) -> BackendResult<KeyValue> {
    Ok(bincode::deserialize(value)?)
}

impl Tables for SledTables {
    fn load_revisions(&self) -> BackendResult<(u64, u64)> {
        Ok((self.read_u64(REVISION_KEY)?, self.read_u64(COMPACTED_KEY)?))
    }

    fn get(
        &self,
        key: &str,
    ) -> BackendResult<Option<KeyValue>> {
        match self.data.get(key.as_bytes())? {
            Some(value) => Ok(Some(decode_kv(&value)?)),
            None => Ok(None),
        }
    }

    fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: Option<usize>,
    ) -> BackendResult<(Vec<KeyValue>, bool)> {
        let lower: Bound<Vec<u8>> = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.as_bytes().to_vec()),
            _ => Bound::Included(prefix.as_bytes().to_vec()),
        };
        let prefix_bytes = prefix.as_bytes().to_vec();
        let iter = self
            .data
            .range((lower, Bound::<Vec<u8>>::Unbounded))
            .take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(&prefix_bytes),
                Err(_) => true,
            })
            .map(|item| {
                let (_, value) = item?;
                decode_kv(&value)
            });
        take_page(iter, limit)
    }

    fn apply(
        &mut self,
        event: &BackendEvent,
    ) -> BackendResult<()> {
        let key = event.kv.key.as_bytes();
        let entry = match event.kind {
            EventKind::Put => Some(bincode::serialize(&event.kv)?),
            EventKind::Delete => None,
        };
        let record = bincode::serialize(event)?;
        let revision = revision_to_key(event.revision);

        let result: Result<(), TransactionError<BackendError>> = (&self.data, &self.events, &self.meta)
            .transaction(|(data, events, meta)| {
                match &entry {
                    Some(bytes) => {
                        data.insert(key, bytes.as_slice())?;
                    }
                    None => {
                        data.remove(key)?;
                    }
                }
                events.insert(&revision[..], record.as_slice())?;
                meta.insert(REVISION_KEY, &revision[..])?;
                Ok::<(), ConflictableTransactionError<BackendError>>(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        })
    }

    fn events(
        &self,
        from: u64,
        to: u64,
    ) -> BackendResult<Vec<BackendEvent>> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for item in self.events.range(revision_to_key(from)..=revision_to_key(to)) {
            let (_, value) = item?;
            events.push(bincode::deserialize(&value)?);
        }
        Ok(events)
    }

    fn compact(
        &mut self,
        revision: u64,
    ) -> BackendResult<()> {
        // Record the cutoff before dropping events so a crash in between
        // never hides a gap.
        self.meta.insert(COMPACTED_KEY, &revision_to_key(revision)[..])?;

        let mut batch = Batch::default();
        for item in self.events.range(..=revision_to_key(revision)) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.events.apply_batch(batch)?;
        Ok(())
    }

    fn deadlines(&self) -> BackendResult<Vec<(String, u64)>> {
        let mut deadlines = Vec::new();
        for item in self.data.iter() {
            let (_, value) = item?;
            let kv = decode_kv(&value)?;
            if let Some(deadline) = kv.expires_at_ms {
                deadlines.push((kv.key, deadline));
            }
        }
        Ok(deadlines)
    }
}
