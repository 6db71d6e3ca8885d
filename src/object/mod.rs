//! Typed object model stored through the storage contract.
//!
//! Every stored kind implements [`StorageObject`]; the storage layer stays
//! generic over the kind while each call site is statically typed. Objects
//! are encoded through a [`Codec`] and never persist their resourceVersion:
//! it is stamped on decode from the backend's modify revision.

mod codec;
mod keys;
mod selection;

#[cfg(test)]
mod selection_test;

use std::collections::BTreeMap;
use std::fmt::Debug;

pub use codec::*;
pub use keys::*;
pub use selection::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Metadata shared by every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// Opaque token, empty until the object has been read from storage
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_uid(
        mut self,
        uid: impl Into<String>,
    ) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A kind that can be persisted and watched.
pub trait StorageObject:
    Clone + Default + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Short kind name used for metrics and tracing
    fn kind() -> &'static str {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name)
    }

    /// Fields addressable by a [`FieldSelector`].
    ///
    /// Kinds with extra selectable fields should extend the default set.
    fn fields(&self) -> FieldSet {
        object_meta_fields(self.metadata())
    }
}

/// Result of a list-style read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    pub resource_version: String,
    /// Set when more items remain after a limited list
    pub continue_token: Option<String>,
}

impl<T> ObjectList<T> {
    pub fn new(
        items: Vec<T>,
        resource_version: u64,
    ) -> Self {
        Self {
            items,
            resource_version: resource_version.to_string(),
            continue_token: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
