//! Fixtures shared by unit tests: a sample kind and ready-made stores.

mod pod;
mod stores;

pub use pod::*;
pub use stores::*;
