//! Typed object storage over a revisioned key-value store, plus an
//! in-memory watch cache.
//!
//! - [`KvStore`] maps typed objects onto a [`backend::KvBackend`] with
//!   compare-and-swap writes, prefix listing and resumable watches.
//! - [`Cacher`] sits in front of any [`Storage`] and serves reads and
//!   watches of one resource prefix from memory.
//!
//! Both implement [`Storage`], so callers can swap one for the other.

mod cacher;
mod errors;
mod metrics;
mod storage;
mod store;
mod versioner;

pub mod backend;
pub mod config;
pub mod object;

pub use crate::cacher::*;
pub use crate::config::StorageConfig;
pub use crate::errors::*;
pub use crate::metrics::*;
pub use crate::storage::*;
pub use crate::store::KvStore;
pub use crate::versioner::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
