//! Conversion between backend revisions and caller-visible resourceVersions.
//!
//! The token is the decimal form of the backend's `u64` revision. `""` and
//! `"0"` both mean "latest / any" and parse to `0`.

use crate::object::StorageObject;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Versioner;

impl Versioner {
    pub fn new() -> Self {
        Self
    }

    /// Parses a caller-supplied resourceVersion
    pub fn parse_resource_version(
        &self,
        resource_version: &str,
    ) -> Result<u64> {
        if resource_version.is_empty() {
            return Ok(0);
        }
        resource_version.parse::<u64>().map_err(|e| {
            StorageError::Invalid(format!("invalid resource version `{resource_version}`: {e}"))
                .into()
        })
    }

    /// Revision stamped on `obj`, `0` when unset
    pub fn object_resource_version<T: StorageObject>(
        &self,
        obj: &T,
    ) -> Result<u64> {
        self.parse_resource_version(&obj.metadata().resource_version)
    }

    pub fn update_object<T: StorageObject>(
        &self,
        obj: &mut T,
        resource_version: u64,
    ) {
        obj.metadata_mut().resource_version = if resource_version == 0 {
            String::new()
        } else {
            resource_version.to_string()
        };
    }

    /// Clears the stamp before an object is encoded for storage
    pub fn prepare_object_for_storage<T: StorageObject>(
        &self,
        obj: &mut T,
    ) {
        obj.metadata_mut().resource_version.clear();
    }
}
