//! # Cross-Resource Finalizers
//!
//! Some resources reference a managed resource without being owned by it,
//! possibly from another namespace, so owner references and garbage
//! collection cannot tie them together. The referenced side keeps them alive
//! instead: it places a finalizer on every referencing object it discovers
//! through a [`FieldIndex`] and removes the finalizer only after it has
//! reacted to the object's deletion.
//!
//! The [`EdgeTable`] remembers which objects each parent tracked on its last
//! pass. An object whose reference moved away no longer shows up in the
//! indexed lookup; the edge table is how its finalizer still gets released.

use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::index::FieldIndex;
use crate::controller::managed::Managed;
use crate::controller::store::{has_finalizer, is_deleting, Object, ObjectKey, ObjectStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Parent key to the keys of the objects it holds a finalizer on
#[derive(Debug, Default)]
pub struct EdgeTable {
    edges: RwLock<BTreeMap<ObjectKey, BTreeSet<ObjectKey>>>,
}

impl EdgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the edges of `parent`, returning the ones that went away
    pub fn record(&self, parent: &ObjectKey, children: BTreeSet<ObjectKey>) -> Vec<ObjectKey> {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        let previous = if children.is_empty() {
            edges.remove(parent).unwrap_or_default()
        } else {
            edges.insert(parent.clone(), children.clone()).unwrap_or_default()
        };
        previous.difference(&children).cloned().collect()
    }

    pub fn children_of(&self, parent: &ObjectKey) -> BTreeSet<ObjectKey> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        edges.get(parent).cloned().unwrap_or_default()
    }

    pub fn parents_of(&self, child: &ObjectKey) -> Vec<ObjectKey> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        edges
            .iter()
            .filter(|(_, children)| children.contains(child))
            .map(|(parent, _)| parent.clone())
            .collect()
    }

    pub fn forget(&self, parent: &ObjectKey) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.remove(parent);
    }
}

/// Referencing objects found on one pass
#[derive(Debug, Clone)]
pub struct Tracked<R> {
    /// Live references, finalizer in place
    pub active: Vec<R>,
    /// Being deleted and still held by our finalizer
    pub deleting: Vec<R>,
}

impl<R> Default for Tracked<R> {
    fn default() -> Self {
        Self {
            active: Vec::new(),
            deleting: Vec::new(),
        }
    }
}

/// Finalizer bookkeeping for objects of kind `R` referencing a `P`
pub struct FinalizerTracker<P, R> {
    finalizer: &'static str,
    index: Arc<FieldIndex<R>>,
    index_name: &'static str,
    edges: Arc<EdgeTable>,
    _parent: PhantomData<fn() -> P>,
}

impl<P, R> std::fmt::Debug for FinalizerTracker<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerTracker")
            .field("finalizer", &self.finalizer)
            .field("index_name", &self.index_name)
            .finish_non_exhaustive()
    }
}

impl<P: Managed, R: Object> FinalizerTracker<P, R> {
    /// `index_name` must extract the `namespace/name` of the referenced `P`
    pub fn new(
        finalizer: &'static str,
        index: Arc<FieldIndex<R>>,
        index_name: &'static str,
        edges: Arc<EdgeTable>,
    ) -> Self {
        Self {
            finalizer,
            index,
            index_name,
            edges,
            _parent: PhantomData,
        }
    }

    pub fn edges(&self) -> &Arc<EdgeTable> {
        &self.edges
    }

    /// Discover the objects referencing `parent` and hold them
    ///
    /// Adds the finalizer to live references that lack it, records the edge
    /// set and releases objects whose reference moved to a resource that no
    /// longer exists.
    pub async fn track<S: ObjectStore>(
        &self,
        parent: &P,
        ctx: &Context<S>,
    ) -> Result<Tracked<R>, ReconcilerError> {
        let parent_key = ObjectKey::of(parent)?;
        let referencing = ctx
            .store
            .list_indexed(self.index.as_ref(), self.index_name, &parent_key.to_string())
            .await?;

        let mut tracked = Tracked::default();
        let mut keys = BTreeSet::new();
        for mut obj in referencing {
            let key = ObjectKey::of(&obj)?;
            if is_deleting(&obj) {
                if has_finalizer(&obj, self.finalizer) {
                    keys.insert(key);
                    tracked.deleting.push(obj);
                }
                continue;
            }
            if !has_finalizer(&obj, self.finalizer) {
                let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
                finalizers.push(self.finalizer.to_string());
                ctx.store.set_finalizers::<R>(&key, &finalizers).await?;
                info!(
                    parent = %parent_key,
                    object = %key,
                    finalizer = self.finalizer,
                    "finalizer added"
                );
                obj.meta_mut().finalizers = Some(finalizers);
            }
            keys.insert(key);
            tracked.active.push(obj);
        }

        for stale in self.edges.record(&parent_key, keys) {
            let Some(obj) = ctx.store.get::<R>(&stale).await? else {
                continue;
            };
            if has_finalizer(&obj, self.finalizer)
                && !self.held_elsewhere(&parent_key, &obj, ctx).await?
            {
                debug!(parent = %parent_key, object = %stale, "releasing moved reference");
                self.release(ctx, std::slice::from_ref(&obj)).await?;
            }
        }
        Ok(tracked)
    }

    /// Remove our finalizer from `objects`, leaving any others in place
    pub async fn release<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
        objects: &[R],
    ) -> Result<(), ReconcilerError> {
        for obj in objects {
            if !has_finalizer(obj, self.finalizer) {
                continue;
            }
            let key = ObjectKey::of(obj)?;
            let finalizers: Vec<String> = obj
                .meta()
                .finalizers
                .iter()
                .flatten()
                .filter(|f| f.as_str() != self.finalizer)
                .cloned()
                .collect();
            ctx.store.set_finalizers::<R>(&key, &finalizers).await?;
            info!(object = %key, finalizer = self.finalizer, "finalizer released");
        }
        Ok(())
    }

    /// Whether an existing `P` other than `parent` is what `obj` references now
    async fn held_elsewhere<S: ObjectStore>(
        &self,
        parent: &ObjectKey,
        obj: &R,
        ctx: &Context<S>,
    ) -> Result<bool, ReconcilerError> {
        for target in self.index.values(self.index_name, obj) {
            let Some(key) = ObjectKey::parse(&target) else {
                continue;
            };
            if &key != parent && ctx.store.get::<P>(&key).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Current and previously tracked objects of `parent` carrying our finalizer
    ///
    /// A previously tracked object now recorded by another parent, or
    /// referencing another existing `P`, belongs to that parent.
    async fn held<S: ObjectStore>(
        &self,
        parent: &P,
        ctx: &Context<S>,
    ) -> Result<Vec<R>, ReconcilerError> {
        let parent_key = ObjectKey::of(parent)?;
        let mut held: BTreeMap<ObjectKey, R> = BTreeMap::new();
        for obj in ctx
            .store
            .list_indexed(self.index.as_ref(), self.index_name, &parent_key.to_string())
            .await?
        {
            held.insert(ObjectKey::of(&obj)?, obj);
        }
        for key in self.edges.children_of(&parent_key) {
            if held.contains_key(&key)
                || self.edges.parents_of(&key).iter().any(|p| p != &parent_key)
            {
                continue;
            }
            let Some(obj) = ctx.store.get::<R>(&key).await? else {
                continue;
            };
            if !self.held_elsewhere(&parent_key, &obj, ctx).await? {
                held.insert(key, obj);
            }
        }
        Ok(held
            .into_values()
            .filter(|obj| has_finalizer(obj, self.finalizer))
            .collect())
    }
}

/// Finalizer cleanup the driver runs while deleting its resource
#[async_trait]
pub trait ForeignFinalizers<P, S>: Send + Sync {
    /// Release every finalizer `parent` placed on other objects
    async fn release_all(&self, parent: &P, ctx: &Context<S>) -> Result<(), ReconcilerError>;

    /// Number of objects still held on behalf of `parent`
    async fn remaining(&self, parent: &P, ctx: &Context<S>) -> Result<usize, ReconcilerError>;

    fn forget(&self, parent: &ObjectKey);
}

#[async_trait]
impl<P, R, S> ForeignFinalizers<P, S> for FinalizerTracker<P, R>
where
    P: Managed,
    R: Object,
    S: ObjectStore,
{
    async fn release_all(&self, parent: &P, ctx: &Context<S>) -> Result<(), ReconcilerError> {
        let held = self.held(parent, ctx).await?;
        self.release(ctx, &held).await
    }

    async fn remaining(&self, parent: &P, ctx: &Context<S>) -> Result<usize, ReconcilerError> {
        Ok(self.held(parent, ctx).await?.len())
    }

    fn forget(&self, parent: &ObjectKey) {
        self.edges.forget(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[test]
    fn test_record_returns_dropped_edges() {
        let table = EdgeTable::new();
        let parent = key("ls");

        assert!(table
            .record(&parent, BTreeSet::from([key("a"), key("b")]))
            .is_empty());
        assert_eq!(
            table.record(&parent, BTreeSet::from([key("b"), key("c")])),
            vec![key("a")]
        );
        assert_eq!(table.children_of(&parent), BTreeSet::from([key("b"), key("c")]));
    }

    #[test]
    fn test_parents_of_and_forget() {
        let table = EdgeTable::new();
        table.record(&key("one"), BTreeSet::from([key("p")]));
        table.record(&key("two"), BTreeSet::from([key("p"), key("q")]));

        assert_eq!(table.parents_of(&key("p")), vec![key("one"), key("two")]);

        table.forget(&key("two"));
        assert_eq!(table.parents_of(&key("q")), Vec::<ObjectKey>::new());
    }

    #[test]
    fn test_recording_empty_set_drops_parent() {
        let table = EdgeTable::new();
        table.record(&key("ls"), BTreeSet::from([key("p")]));
        assert_eq!(table.record(&key("ls"), BTreeSet::new()), vec![key("p")]);
        assert!(table.children_of(&key("ls")).is_empty());
    }
}
