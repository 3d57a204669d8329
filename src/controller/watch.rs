//! Watch invalidation: map a change on a referenced object to reconcile
//! requests for every managed resource whose index entry names it.

use crate::controller::index::FieldIndex;
use crate::controller::store::{Object, ObjectKey};
use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;

/// Keys of the resources in `index` whose `index_name` entry is `changed`
pub fn requests_for<P: Object, R: Object>(
    index: &FieldIndex<P>,
    index_name: &str,
    changed: &R,
) -> Vec<ObjectKey> {
    match ObjectKey::of(changed) {
        Ok(key) => index.lookup_keys(index_name, &key.to_string()),
        Err(_) => Vec::new(),
    }
}

pub fn object_ref<P: Object>(key: &ObjectKey) -> ObjectRef<P> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Mapper for `Controller::watches`
pub fn index_mapper<P: Object, R: Object>(
    index: Arc<FieldIndex<P>>,
    index_name: &'static str,
) -> impl Fn(R) -> Vec<ObjectRef<P>> + Send + Sync + Clone + 'static {
    move |changed: R| {
        requests_for(index.as_ref(), index_name, &changed)
            .iter()
            .map(object_ref::<P>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::api::ObjectMeta;

    fn config_map(name: &str, secrets: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some([("secrets".to_string(), secrets.to_string())].into()),
            ..Default::default()
        }
    }

    fn secret(namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn index() -> FieldIndex<ConfigMap> {
        let index = FieldIndex::new().with_index("secrets", |cm: &ConfigMap| {
            cm.data
                .as_ref()
                .and_then(|data| data.get("secrets"))
                .map(|names| names.split(',').map(|n| format!("ns/{n}")).collect())
                .unwrap_or_default()
        });
        index.apply(config_map("a", "creds,tls"));
        index.apply(config_map("b", "creds"));
        index
    }

    #[test]
    fn test_one_request_per_referencing_resource() {
        let index = index();
        let keys = requests_for(&index, "secrets", &secret("ns", "creds"));
        assert_eq!(keys, vec![ObjectKey::new("ns", "a"), ObjectKey::new("ns", "b")]);
    }

    #[test]
    fn test_lookup_is_scoped_to_namespace() {
        let index = index();
        assert!(requests_for(&index, "secrets", &secret("other", "creds")).is_empty());
    }

    #[test]
    fn test_mapper_builds_object_refs() {
        let mapper = index_mapper::<ConfigMap, Secret>(Arc::new(index()), "secrets");
        let refs = mapper(secret("ns", "tls"));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[0].namespace.as_deref(), Some("ns"));
    }
}
