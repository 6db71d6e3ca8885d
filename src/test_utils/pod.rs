use serde::Deserialize;
use serde::Serialize;

use crate::object::FieldSet;
use crate::object::ObjectMeta;
use crate::object::StorageObject;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub node_name: String,
    pub counter: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

impl StorageObject for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn fields(&self) -> FieldSet {
        let mut fields = crate::object::object_meta_fields(&self.metadata);
        fields.insert("spec.nodeName".to_string(), self.spec.node_name.clone());
        fields
    }
}

pub fn pod(
    namespace: &str,
    name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta::new(namespace, name).with_uid(format!("uid-{namespace}-{name}")),
        spec: PodSpec::default(),
    }
}

pub fn pod_on_node(
    namespace: &str,
    name: &str,
    node: &str,
) -> Pod {
    let mut p = pod(namespace, name);
    p.spec.node_name = node.to_string();
    p
}

/// Object with its resourceVersion cleared, for comparisons across writes
pub fn unstamped(mut p: Pod) -> Pod {
    p.metadata.resource_version.clear();
    p
}
