//! # Field Indexes
//!
//! Reverse lookups from a referenced object (`namespace/name`) to the
//! resources whose spec references it. Extractors are registered by name at
//! startup; the index is fed by a watcher so lookups never scan the store.

use crate::controller::store::{Object, ObjectKey};
use futures::{StreamExt, TryStreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource as _};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Extraction function over a resource returning zero or more index values
pub type Extractor<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Named set of extractors plus the values they produced for every known object
pub struct FieldIndex<K> {
    extractors: BTreeMap<&'static str, Extractor<K>>,
    state: RwLock<IndexState<K>>,
}

struct IndexState<K> {
    objects: HashMap<ObjectKey, K>,
    entries: HashMap<(&'static str, String), BTreeSet<ObjectKey>>,
}

impl<K> Default for IndexState<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl<K> fmt::Debug for FieldIndex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldIndex")
            .field("indexes", &self.extractors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<K: Object> Default for FieldIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> FieldIndex<K> {
    pub fn new() -> Self {
        Self {
            extractors: BTreeMap::new(),
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Register an extractor under `name`
    #[must_use]
    pub fn with_index<F>(mut self, name: &'static str, extractor: F) -> Self
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        self.extractors.insert(name, Arc::new(extractor));
        self
    }

    /// Values the `name` extractor yields for `obj` (deduplicated, sorted)
    pub fn values(&self, name: &str, obj: &K) -> Vec<String> {
        self.extractors
            .get(name)
            .map(|extract| {
                extract(obj)
                    .into_iter()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or refresh one object
    pub fn apply(&self, obj: K) {
        let Ok(key) = ObjectKey::of(&obj) else {
            return;
        };
        let computed = self.compute(&obj);
        let mut state = self.write();
        Self::unlink(&mut state, &key);
        for entry in computed {
            state.entries.entry(entry).or_default().insert(key.clone());
        }
        state.objects.insert(key, obj);
    }

    /// Record an object seen outside the index watch, such as a controller event
    ///
    /// A deleting object with no finalizers left is gone from the cluster and
    /// is dropped instead.
    pub fn observe(&self, obj: K) {
        let meta = obj.meta();
        let purged = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().is_none_or(Vec::is_empty);
        if !purged {
            self.apply(obj);
        } else if let Ok(key) = ObjectKey::of(&obj) {
            self.remove(&key);
        }
    }

    /// Drop one object
    pub fn remove(&self, key: &ObjectKey) {
        let mut state = self.write();
        Self::unlink(&mut state, key);
        state.objects.remove(key);
    }

    /// Replace the whole content after a (re)list
    pub fn replace_all(&self, objects: Vec<K>) {
        let mut fresh = IndexState::default();
        for obj in objects {
            let Ok(key) = ObjectKey::of(&obj) else {
                continue;
            };
            for entry in self.compute(&obj) {
                fresh.entries.entry(entry).or_default().insert(key.clone());
            }
            fresh.objects.insert(key, obj);
        }
        *self.write() = fresh;
    }

    /// Keys of every object whose `name` extraction contains `value`
    pub fn lookup_keys(&self, name: &str, value: &str) -> Vec<ObjectKey> {
        let state = self.read();
        self.extractors
            .get_key_value(name)
            .and_then(|(name, _)| state.entries.get(&(*name, value.to_string())))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cached objects whose `name` extraction contains `value`
    pub fn lookup(&self, name: &str, value: &str) -> Vec<K> {
        let keys = self.lookup_keys(name, value);
        let state = self.read();
        keys.iter()
            .filter_map(|key| state.objects.get(key).cloned())
            .collect()
    }

    /// Keep the index in sync with the cluster until the watch stream ends
    pub async fn run(self: Arc<Self>, api: Api<K>) {
        let mut buffer = Vec::new();
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            match stream.try_next().await {
                Ok(Some(event)) => match event {
                    watcher::Event::Apply(obj) => self.apply(obj),
                    watcher::Event::Delete(obj) => {
                        if let Ok(key) = ObjectKey::of(&obj) {
                            self.remove(&key);
                        }
                    }
                    watcher::Event::Init => buffer.clear(),
                    watcher::Event::InitApply(obj) => buffer.push(obj),
                    watcher::Event::InitDone => {
                        debug!(objects = buffer.len(), "field index relisted");
                        self.replace_all(std::mem::take(&mut buffer));
                    }
                },
                Ok(None) => break,
                Err(e) => warn!(error = %e, "field index watch error"),
            }
        }
    }

    fn compute(&self, obj: &K) -> Vec<(&'static str, String)> {
        self.extractors
            .iter()
            .flat_map(|(name, extract)| extract(obj).into_iter().map(move |value| (*name, value)))
            .collect()
    }

    fn unlink(state: &mut IndexState<K>, key: &ObjectKey) {
        state.entries.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState<K>> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState<K>> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str, target: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some([("target".to_string(), target.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn index() -> FieldIndex<ConfigMap> {
        FieldIndex::new().with_index("target", |cm: &ConfigMap| {
            cm.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("target").cloned())
                .into_iter()
                .collect()
        })
    }

    #[test]
    fn test_lookup_follows_updates() {
        let index = index();
        index.apply(config_map("a", "x"));
        index.apply(config_map("b", "x"));
        assert_eq!(index.lookup_keys("target", "x").len(), 2);

        index.apply(config_map("a", "y"));
        assert_eq!(
            index.lookup_keys("target", "x"),
            vec![ObjectKey::new("ns", "b")]
        );
        assert_eq!(index.lookup("target", "y").len(), 1);

        index.remove(&ObjectKey::new("ns", "b"));
        assert!(index.lookup_keys("target", "x").is_empty());
    }

    #[test]
    fn test_replace_all_drops_stale_entries() {
        let index = index();
        index.apply(config_map("a", "x"));
        index.replace_all(vec![config_map("c", "z")]);

        assert!(index.lookup_keys("target", "x").is_empty());
        assert_eq!(index.lookup_keys("target", "z"), vec![ObjectKey::new("ns", "c")]);
    }

    #[test]
    fn test_observe_indexes_live_and_drops_purged() {
        let index = index();
        index.observe(config_map("a", "x"));
        assert_eq!(index.lookup_keys("target", "x"), vec![ObjectKey::new("ns", "a")]);

        let mut held = config_map("a", "x");
        held.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap();
        held.metadata.finalizers = Some(vec!["keep".to_string()]);
        index.observe(held.clone());
        assert_eq!(index.lookup_keys("target", "x").len(), 1);

        held.metadata.finalizers = None;
        index.observe(held);
        assert!(index.lookup_keys("target", "x").is_empty());
    }

    #[test]
    fn test_unknown_index_yields_nothing() {
        let index = index();
        index.apply(config_map("a", "x"));
        assert!(index.lookup_keys("missing", "x").is_empty());
        assert!(index.values("missing", &config_map("a", "x")).is_empty());
    }
}
