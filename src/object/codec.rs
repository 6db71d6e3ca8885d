use std::marker::PhantomData;

use bytes::Bytes;

use super::StorageObject;
use crate::Result;
use crate::StorageError;

/// Serializer registered per kind.
///
/// Encoding must be deterministic: `guaranteed_update` compares encoded
/// bytes to decide whether a write is needed.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(
        &self,
        obj: &T,
    ) -> Result<Bytes>;

    fn decode(
        &self,
        data: &[u8],
    ) -> Result<T>;
}

/// Default codec backed by `bincode`
pub struct BincodeCodec<T> {
    _kind: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self { _kind: PhantomData }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BincodeCodec").finish()
    }
}

impl<T: StorageObject> Codec<T> for BincodeCodec<T> {
    fn encode(
        &self,
        obj: &T,
    ) -> Result<Bytes> {
        bincode::serialize(obj).map(Bytes::from).map_err(|e| {
            StorageError::Internal(format!("failed to encode {}: {e}", T::kind())).into()
        })
    }

    fn decode(
        &self,
        data: &[u8],
    ) -> Result<T> {
        bincode::deserialize(data).map_err(|e| {
            StorageError::Internal(format!("failed to decode {}: {e}", T::kind())).into()
        })
    }
}
