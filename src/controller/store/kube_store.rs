//! # Kubernetes Store
//!
//! [`ObjectStore`] backed by the API server through typed `Api<K>` handles.

use super::{Object, ObjectKey, ObjectStore};
use crate::constants::FIELD_MANAGER;
use crate::controller::error::StoreError;
use crate::controller::index::FieldIndex;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Object store talking to a live cluster
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.api::<K>(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(&selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn list_indexed<K: Object>(
        &self,
        index: &FieldIndex<K>,
        index_name: &str,
        value: &str,
    ) -> Result<Vec<K>, StoreError> {
        // The index cache may lag behind our own finalizer writes; re-read each hit
        let mut found = Vec::new();
        for key in index.lookup_keys(index_name, value) {
            if let Some(obj) = self.get::<K>(&key).await? {
                found.push(obj);
            }
        }
        Ok(found)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api::<K>(&key.namespace).create(&params, obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                Err(StoreError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api::<K>(&key.namespace)
            .patch(&key.name, &params, &Patch::Apply(obj))
            .await?)
    }

    async fn delete<K: Object>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        match self
            .api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!(object = %key, "already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_finalizers<K: Object>(
        &self,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<(), StoreError> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match self
            .api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: Object>(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let patch = json!({ "status": status });
        match self
            .api::<K>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_is_sorted_and_comma_joined() {
        let labels: BTreeMap<_, _> = [
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]
        .into();
        assert_eq!(selector(&labels), "a=1,b=2");
    }
}
