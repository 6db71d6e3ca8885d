//! Storage Error Hierarchy
//!
//! Defines the error taxonomy surfaced by every storage contract
//! implementation (`KvStore`, `Cacher`), plus configuration failures.
//!
//! Backend specific failures never leak past the `KvStore` boundary: they are
//! translated into [`StorageError`] there. Only `guaranteed_update` (and a
//! delete carrying preconditions) retries internally, and only on a lost
//! compare-and-swap.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage contract failures (see [`StorageError`])
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Metric registration or encoding failures
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

/// Caller-visible storage failures.
///
/// `Clone` so the same error can be delivered in-stream as a
/// [`crate::WatchEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Key absent
    #[error("Key not found: {key}, resource version: {resource_version}")]
    NotFound { key: String, resource_version: u64 },

    /// Create collided with an existing key
    #[error("Key exists: {key}, resource version: {resource_version}")]
    AlreadyExists { key: String, resource_version: u64 },

    /// resourceVersion / compare-and-swap mismatch
    #[error("Resource version conflicts: {key}, resource version: {resource_version}")]
    Conflict { key: String, resource_version: u64 },

    /// UID or resourceVersion precondition did not hold
    #[error("Precondition failed for {key}: {reason}")]
    PreconditionFailed { key: String, reason: String },

    /// External store unavailable
    #[error("Server unreachable for {key}: {reason}")]
    Unreachable { key: String, reason: String },

    /// Requested point predates retained history; restart with a fresh list
    #[error("Too old resource version: {requested} (oldest retained: {oldest})")]
    ResourceVersionTooOld { requested: u64, oldest: u64 },

    /// Requested point not observed within the deadline
    #[error("Too large resource version: {requested}, current: {current}")]
    ResourceVersionTooLarge { requested: u64, current: u64 },

    /// Malformed request (unparsable resourceVersion, rv set on create, ...)
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Encode/decode failures and invariant violations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn not_found(
        key: impl Into<String>,
        resource_version: u64,
    ) -> Self {
        StorageError::NotFound {
            key: key.into(),
            resource_version,
        }
    }

    pub fn already_exists(
        key: impl Into<String>,
        resource_version: u64,
    ) -> Self {
        StorageError::AlreadyExists {
            key: key.into(),
            resource_version,
        }
    }

    pub fn conflict(
        key: impl Into<String>,
        resource_version: u64,
    ) -> Self {
        StorageError::Conflict {
            key: key.into(),
            resource_version,
        }
    }

    pub fn precondition_failed(
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StorageError::PreconditionFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn unreachable(
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StorageError::Unreachable {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StorageError::PreconditionFailed { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, StorageError::Unreachable { .. })
    }

    pub fn is_too_old_resource_version(&self) -> bool {
        matches!(self, StorageError::ResourceVersionTooOld { .. })
    }

    pub fn is_too_large_resource_version(&self) -> bool {
        matches!(self, StorageError::ResourceVersionTooLarge { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, StorageError::Invalid(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, StorageError::Internal(_))
    }

    /// Whether the caller may simply retry the same request later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict { .. }
                | StorageError::Unreachable { .. }
                | StorageError::ResourceVersionTooLarge { .. }
        )
    }
}

impl Error {
    /// The storage failure carried by this error, if any
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            Error::Storage(e) => Some(e),
            Error::Config(_) | Error::Metrics(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.storage().is_some_and(StorageError::is_not_found)
    }

    pub fn is_already_exists(&self) -> bool {
        self.storage().is_some_and(StorageError::is_already_exists)
    }

    pub fn is_conflict(&self) -> bool {
        self.storage().is_some_and(StorageError::is_conflict)
    }

    pub fn is_precondition_failed(&self) -> bool {
        self.storage().is_some_and(StorageError::is_precondition_failed)
    }

    pub fn is_unreachable(&self) -> bool {
        self.storage().is_some_and(StorageError::is_unreachable)
    }

    pub fn is_too_old_resource_version(&self) -> bool {
        self.storage().is_some_and(StorageError::is_too_old_resource_version)
    }

    pub fn is_too_large_resource_version(&self) -> bool {
        self.storage().is_some_and(StorageError::is_too_large_resource_version)
    }

    pub fn is_invalid(&self) -> bool {
        self.storage().is_some_and(StorageError::is_invalid)
    }

    pub fn is_internal(&self) -> bool {
        self.storage().is_some_and(StorageError::is_internal)
    }
}
