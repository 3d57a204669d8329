//! # In-Memory Store
//!
//! A fake object store with the semantics the engine relies on:
//!
//! - server-assigned metadata (`uid`, `resourceVersion`, `generation`,
//!   `creationTimestamp`)
//! - deletion of an object carrying finalizers only sets `deletionTimestamp`;
//!   clearing the last finalizer then purges it
//! - server-side apply prunes fields the previous apply owned and the new
//!   manifest no longer sets, leaving fields written by others untouched
//! - `generation` moves only when something outside metadata and status changes
//!
//! Every write made through [`ObjectStore`] is recorded so tests can assert on
//! the exact set of mutations a pass performed. The inherent helpers
//! (`seed`, `mutate`, `set_status`, `request_delete`) act like other clients
//! and are not recorded.
//!
//! Finalizer and status patches can be made to misbehave with
//! [`MemoryStore::inject`].

use super::{Object, ObjectKey, ObjectStore};
use crate::controller::error::StoreError;
use crate::controller::index::FieldIndex;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Kind of mutation recorded by [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Apply,
    Delete,
    SetFinalizers,
    PatchStatus,
}

/// Misbehavior injected into matching writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a conflict and leave the object untouched
    Reject,
    /// Report success but leave the object untouched, as if another client reverted it
    Lose,
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub op: WriteOp,
    pub kind: String,
    pub key: ObjectKey,
}

impl std::fmt::Display for Write {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {} {}", self.op, self.kind, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone)]
struct Entry {
    object: Value,
    applied: Option<Value>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<EntryKey, Entry>,
    writes: Vec<Write>,
    faults: Vec<(WriteOp, String, Fault)>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory [`ObjectStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn entry_key<K: Object>(key: &ObjectKey) -> EntryKey {
    EntryKey {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
    }
}

fn same_type<K: Object>(entry: &EntryKey) -> bool {
    entry.api_version == K::api_version(&()) && entry.kind == K::kind(&())
}

fn timestamp() -> Value {
    Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

fn metadata_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    object
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

/// Everything `generation` tracks: the object minus metadata and status
fn generation_view(object: &Value) -> Value {
    let mut view = object.clone();
    if let Some(map) = view.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    view
}

/// Remove from `current` every path `previous` set that `next` no longer sets
fn prune(current: &mut Value, previous: &Value, next: &Value) {
    let (Some(current), Some(previous)) = (current.as_object_mut(), previous.as_object()) else {
        return;
    };
    for (key, previous_value) in previous {
        match next.get(key) {
            None => {
                current.remove(key);
            }
            Some(next_value) if previous_value.is_object() && next_value.is_object() => {
                if let Some(current_value) = current.get_mut(key) {
                    prune(current_value, previous_value, next_value);
                }
            }
            Some(_) => {}
        }
    }
}

/// Recursive object merge; arrays and scalars from `patch` replace
fn merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value);
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn labels_match(object: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = object.pointer("/metadata/labels");
    selector.iter().all(|(key, expected)| {
        labels
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
            .is_some_and(|value| value == expected)
    })
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|finalizers| !finalizers.is_empty())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record<K: Object>(state: &mut State, op: WriteOp, key: &ObjectKey) {
        state.writes.push(Write {
            op,
            kind: K::kind(&()).into_owned(),
            key: key.clone(),
        });
    }

    fn fault<K: Object>(state: &State, op: WriteOp) -> Option<Fault> {
        state
            .faults
            .iter()
            .find(|(fault_op, kind, _)| *fault_op == op && kind == K::kind(&()).as_ref())
            .map(|(_, _, fault)| *fault)
    }

    fn decode<K: Object>(object: &Value) -> Result<K, StoreError> {
        Ok(serde_json::from_value(object.clone())?)
    }

    fn insert_new(state: &mut State, key: EntryKey, mut object: Value, applied: Option<Value>) -> Value {
        let version = state.next_version();
        if let Some(meta) = metadata_mut(&mut object) {
            meta.insert("namespace".to_string(), Value::String(key.namespace.clone()));
            meta.insert(
                "uid".to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
            meta.insert("resourceVersion".to_string(), Value::String(version));
            meta.insert("generation".to_string(), Value::from(1));
            meta.insert("creationTimestamp".to_string(), timestamp());
        }
        state.objects.insert(
            key,
            Entry {
                object: object.clone(),
                applied,
            },
        );
        object
    }

    /// Replace `entry.object` with `updated`, moving resourceVersion and generation as needed
    fn commit(state: &mut State, key: &EntryKey, mut updated: Value) -> Option<Value> {
        let previous = state.objects.get(key)?.object.clone();
        if updated == previous {
            return Some(previous);
        }
        let version = state.next_version();
        let bump = generation_view(&updated) != generation_view(&previous);
        if let Some(meta) = metadata_mut(&mut updated) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
            if bump {
                let generation = meta.get("generation").and_then(Value::as_i64).unwrap_or(0);
                meta.insert("generation".to_string(), Value::from(generation + 1));
            }
        }
        let entry = state.objects.get_mut(key)?;
        entry.object = updated.clone();
        Some(updated)
    }

    fn mark_deleted(state: &mut State, key: &EntryKey) {
        let Some(entry) = state.objects.get(key) else {
            return;
        };
        if !has_finalizers(&entry.object) {
            state.objects.remove(key);
            return;
        }
        if entry.object.pointer("/metadata/deletionTimestamp").is_some() {
            return;
        }
        let mut updated = entry.object.clone();
        if let Some(meta) = metadata_mut(&mut updated) {
            meta.insert("deletionTimestamp".to_string(), timestamp());
        }
        Self::commit(state, key, updated);
    }

    /// Insert or overwrite an object as another client would, without recording a write
    pub fn seed<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj)?;
        let object = serde_json::to_value(obj)?;
        let mut state = self.lock();
        let entry = entry_key::<K>(&key);
        let existing = state.objects.get(&entry).map(|e| e.object.clone());
        let stored = if let Some(existing) = existing {
            let mut object = object;
            if let Some(meta) = metadata_mut(&mut object) {
                for field in ["uid", "creationTimestamp", "generation"] {
                    if let Some(value) = existing.pointer(&format!("/metadata/{field}")) {
                        meta.entry(field).or_insert_with(|| value.clone());
                    }
                }
            }
            Self::commit(&mut state, &entry, object)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?
        } else {
            Self::insert_new(&mut state, entry, object, None)
        };
        Self::decode(&stored)
    }

    /// Current version of an object
    pub fn object<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&entry_key::<K>(key))
            .and_then(|entry| Self::decode(&entry.object).ok())
    }

    /// Every object of kind `K`
    pub fn all<K: Object>(&self) -> Vec<K> {
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|(key, _)| same_type::<K>(key))
            .filter_map(|(_, entry)| Self::decode(&entry.object).ok())
            .collect()
    }

    /// Edit an object in place as a user would; returns false when it does not exist
    pub fn mutate<K: Object>(&self, key: &ObjectKey, edit: impl FnOnce(&mut K)) -> bool {
        let mut state = self.lock();
        let entry = entry_key::<K>(key);
        let Some(mut obj) = state
            .objects
            .get(&entry)
            .and_then(|e| Self::decode::<K>(&e.object).ok())
        else {
            return false;
        };
        edit(&mut obj);
        match serde_json::to_value(&obj) {
            Ok(updated) => Self::commit(&mut state, &entry, updated).is_some(),
            Err(_) => false,
        }
    }

    /// Delete as a user would, without recording a write
    pub fn request_delete<K: Object>(&self, key: &ObjectKey) {
        let mut state = self.lock();
        Self::mark_deleted(&mut state, &entry_key::<K>(key));
    }

    /// Replace the status as another controller would, without recording a write
    pub fn set_status<K: Object>(&self, key: &ObjectKey, status: Value) -> bool {
        let mut state = self.lock();
        let entry = entry_key::<K>(key);
        let Some(mut updated) = state.objects.get(&entry).map(|e| e.object.clone()) else {
            return false;
        };
        updated["status"] = status;
        Self::commit(&mut state, &entry, updated).is_some()
    }

    /// Writes recorded so far
    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make `op` writes on objects of `kind` behave as `fault` until cleared
    ///
    /// Covers [`WriteOp::SetFinalizers`] and [`WriteOp::PatchStatus`]. The
    /// attempted write is still recorded.
    pub fn inject(&self, op: WriteOp, kind: &str, fault: Fault) {
        self.lock().faults.push((op, kind.to_string(), fault));
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        let state = self.lock();
        state
            .objects
            .get(&entry_key::<K>(key))
            .map(|entry| Self::decode(&entry.object))
            .transpose()
    }

    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|(key, entry)| {
                same_type::<K>(key) && key.namespace == namespace && labels_match(&entry.object, labels)
            })
            .map(|(_, entry)| Self::decode(&entry.object))
            .collect()
    }

    async fn list_indexed<K: Object>(
        &self,
        index: &FieldIndex<K>,
        index_name: &str,
        value: &str,
    ) -> Result<Vec<K>, StoreError> {
        let all: Vec<K> = {
            let state = self.lock();
            state
                .objects
                .iter()
                .filter(|(key, _)| same_type::<K>(key))
                .map(|(_, entry)| Self::decode(&entry.object))
                .collect::<Result<_, _>>()?
        };
        Ok(all
            .into_iter()
            .filter(|obj| index.values(index_name, obj).iter().any(|v| v == value))
            .collect())
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut object = serde_json::to_value(obj)?;
        if let Some(map) = object.as_object_mut() {
            map.remove("status");
        }
        let mut state = self.lock();
        let entry = entry_key::<K>(&key);
        if state.objects.contains_key(&entry) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        Self::record::<K>(&mut state, WriteOp::Create, &key);
        let stored = Self::insert_new(&mut state, entry, object.clone(), Some(object));
        Self::decode(&stored)
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut manifest = serde_json::to_value(obj)?;
        if let Some(map) = manifest.as_object_mut() {
            map.remove("status");
        }
        let mut state = self.lock();
        Self::record::<K>(&mut state, WriteOp::Apply, &key);
        let entry = entry_key::<K>(&key);
        let Some(existing) = state.objects.get(&entry).cloned() else {
            let stored = Self::insert_new(&mut state, entry, manifest.clone(), Some(manifest));
            return Self::decode(&stored);
        };
        let mut updated = existing.object;
        if let Some(previous) = &existing.applied {
            prune(&mut updated, previous, &manifest);
        }
        merge(&mut updated, &manifest);
        let stored = Self::commit(&mut state, &entry, updated)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(entry) = state.objects.get_mut(&entry) {
            entry.applied = Some(manifest);
        }
        Self::decode(&stored)
    }

    async fn delete<K: Object>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::record::<K>(&mut state, WriteOp::Delete, key);
        Self::mark_deleted(&mut state, &entry_key::<K>(key));
        Ok(())
    }

    async fn set_finalizers<K: Object>(
        &self,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let entry = entry_key::<K>(key);
        let Some(mut updated) = state.objects.get(&entry).map(|e| e.object.clone()) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        Self::record::<K>(&mut state, WriteOp::SetFinalizers, key);
        match Self::fault::<K>(&state, WriteOp::SetFinalizers) {
            Some(Fault::Reject) => return Err(StoreError::Conflict(key.to_string())),
            Some(Fault::Lose) => return Ok(()),
            None => {}
        }
        let deleting = updated.pointer("/metadata/deletionTimestamp").is_some();
        let encoded = serde_json::to_value(finalizers)?;
        if let Some(meta) = metadata_mut(&mut updated) {
            if finalizers.is_empty() {
                meta.remove("finalizers");
            } else {
                meta.insert("finalizers".to_string(), encoded);
            }
        }
        if deleting && finalizers.is_empty() {
            state.objects.remove(&entry);
        } else {
            Self::commit(&mut state, &entry, updated);
        }
        Ok(())
    }

    async fn patch_status<K: Object>(
        &self,
        key: &ObjectKey,
        status: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let entry = entry_key::<K>(key);
        let Some(mut updated) = state.objects.get(&entry).map(|e| e.object.clone()) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        Self::record::<K>(&mut state, WriteOp::PatchStatus, key);
        match Self::fault::<K>(&state, WriteOp::PatchStatus) {
            Some(Fault::Reject) => return Err(StoreError::Conflict(key.to_string())),
            Some(Fault::Lose) => return Ok(()),
            None => {}
        }
        let mut current = updated.get("status").cloned().unwrap_or(Value::Null);
        merge_patch(&mut current, status);
        updated["status"] = current;
        Self::commit(&mut state, &entry, updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some([("app".to_string(), "x".to_string())].into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "cm")
    }

    #[tokio::test]
    async fn test_create_assigns_metadata_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&config_map(&[("a", "1")])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.generation, Some(1));

        let again = store.create(&config_map(&[("a", "1")])).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_prunes_only_owned_fields() {
        let store = MemoryStore::new();
        store.apply(&config_map(&[("a", "1"), ("b", "2")])).await.unwrap();
        store.mutate::<ConfigMap>(&key(), |cm| {
            cm.data
                .get_or_insert_with(Default::default)
                .insert("foreign".to_string(), "kept".to_string());
        });

        store.apply(&config_map(&[("a", "1")])).await.unwrap();
        let cm: ConfigMap = store.object(&key()).unwrap();
        let data = cm.data.unwrap();
        assert_eq!(data.get("a").map(String::as_str), Some("1"));
        assert!(!data.contains_key("b"));
        assert_eq!(data.get("foreign").map(String::as_str), Some("kept"));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        store.create(&config_map(&[])).await.unwrap();
        store
            .set_finalizers::<ConfigMap>(&key(), &["x/y".to_string()])
            .await
            .unwrap();

        store.delete::<ConfigMap>(&key()).await.unwrap();
        let deleting: ConfigMap = store.object(&key()).unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        store.set_finalizers::<ConfigMap>(&key(), &[]).await.unwrap();
        assert!(store.object::<ConfigMap>(&key()).is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_labels_and_namespace() {
        let store = MemoryStore::new();
        store.seed(&config_map(&[])).unwrap();
        let selector: BTreeMap<_, _> = [("app".to_string(), "x".to_string())].into();
        let other: BTreeMap<_, _> = [("app".to_string(), "y".to_string())].into();

        assert_eq!(store.list::<ConfigMap>("ns", &selector).await.unwrap().len(), 1);
        assert!(store.list::<ConfigMap>("ns", &other).await.unwrap().is_empty());
        assert!(store.list::<ConfigMap>("other", &selector).await.unwrap().is_empty());
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_merge_patch_removes_nulls() {
        let mut target = serde_json::json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &serde_json::json!({"a": null, "b": {"c": 4}}));
        assert_eq!(target, serde_json::json!({"b": {"c": 4, "d": 3}}));
    }
}
