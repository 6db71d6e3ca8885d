use std::sync::Arc;

use super::StorageObject;
use crate::Result;
use crate::StorageError;

/// Maps an object to the key it is stored under (without the store prefix)
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<String> + Send + Sync>;

/// `{prefix}/{namespace}/{name}`
pub fn namespace_key_func<T: StorageObject>(
    prefix: &str,
    obj: &T,
) -> Result<String> {
    let meta = obj.metadata();
    if meta.namespace.is_empty() {
        return Err(StorageError::Invalid(format!(
            "namespace is required for {} {}",
            T::kind(),
            meta.name
        ))
        .into());
    }
    if meta.name.is_empty() {
        return Err(StorageError::Invalid(format!("name is required for {}", T::kind())).into());
    }
    Ok(format!("{}/{}/{}", prefix.trim_end_matches('/'), meta.namespace, meta.name))
}

/// `{prefix}/{name}` for cluster scoped kinds
pub fn no_namespace_key_func<T: StorageObject>(
    prefix: &str,
    obj: &T,
) -> Result<String> {
    let meta = obj.metadata();
    if meta.name.is_empty() {
        return Err(StorageError::Invalid(format!("name is required for {}", T::kind())).into());
    }
    Ok(format!("{}/{}", prefix.trim_end_matches('/'), meta.name))
}

/// Key func for namespaced kinds stored under `prefix`
pub fn namespaced_keys<T: StorageObject>(prefix: impl Into<String>) -> KeyFunc<T> {
    let prefix = prefix.into();
    Arc::new(move |obj: &T| namespace_key_func(&prefix, obj))
}

/// Key func for cluster scoped kinds stored under `prefix`
pub fn cluster_keys<T: StorageObject>(prefix: impl Into<String>) -> KeyFunc<T> {
    let prefix = prefix.into();
    Arc::new(move |obj: &T| no_namespace_key_func(&prefix, obj))
}

/// Normalises a list key into a directory prefix ending in `/`.
///
/// `pods/ns` must never match `pods/ns2/...`.
pub fn directory_prefix(key: &str) -> String {
    if key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}
