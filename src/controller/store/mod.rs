//! # Object Store
//!
//! The engine never talks to the API server directly. Every read and write
//! goes through [`ObjectStore`], implemented by [`KubeStore`] for a live
//! cluster and by [`MemoryStore`] for tests.
//!
//! Status writes use their own path (`patch_status`) so they never race spec
//! edits made by users.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{Fault, MemoryStore, Write, WriteOp};

use crate::controller::error::StoreError;
use crate::controller::index::FieldIndex;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Any namespaced resource the engine can read and write
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// `namespace/name` of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object; fails when metadata has no name
    pub fn of<K: Resource>(obj: &K) -> Result<Self, StoreError> {
        let meta = obj.meta();
        let name = meta
            .name
            .clone()
            .ok_or(StoreError::MissingMetadata("metadata.name"))?;
        let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
        Ok(Self { namespace, name })
    }

    /// Parse a `namespace/name` index value
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Typed CRUD, indexed list, finalizer and status access to the object store
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch one object; `None` when it does not exist
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    /// List objects in `namespace` carrying every label in `labels`
    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError>;

    /// Objects whose `index_name` extraction yields `value`
    async fn list_indexed<K: Object>(
        &self,
        index: &FieldIndex<K>,
        index_name: &str,
        value: &str,
    ) -> Result<Vec<K>, StoreError>;

    /// Create an object; `AlreadyExists` when the name is taken
    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Server-side apply `obj` as this operator's field manager
    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Request deletion; a missing object is not an error
    async fn delete<K: Object>(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Replace `metadata.finalizers`
    async fn set_finalizers<K: Object>(
        &self,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<(), StoreError>;

    /// Merge-patch the status subresource with `status`
    async fn patch_status<K: Object>(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Whether the object carries a deletion timestamp
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Whether the object carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}
