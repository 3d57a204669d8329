//! # Step Reconcilers
//!
//! One step per child kind: Read, Diff, Apply, then record the step's own
//! condition. A step reports "not ready yet" as [`StepOutcome::Wait`]
//! rather than an error; the driver halts the pipeline there and requeues.
//!
//! Steps are written against [`ChildReconciler`], which is generic over the
//! child type, and erased into `Box<dyn Step>` when the pipeline is built.

use crate::controller::context::Context;
use crate::controller::diff::{self, Plan};
use crate::controller::error::{ReconcilerError, StoreError};
use crate::controller::managed::{ownership_labels, Managed};
use crate::controller::store::{Object, ObjectKey, ObjectStore};
use crate::crd::{ClusterStatus, Condition, ConditionStatus};
use async_trait::async_trait;
use kube::Resource as _;
use std::time::Duration;
use tracing::{debug, info};

/// Reason a step cannot proceed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wait {
    pub after: Duration,
    pub reason: &'static str,
    pub message: String,
}

/// Result of one step within a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Wait(Wait),
}

/// Live children, expected children and whatever else `read` looked up
#[derive(Debug)]
pub struct Observed<K, R = ()> {
    pub current: Vec<K>,
    pub expected: Vec<K>,
    pub refs: R,
    pub wait: Option<Wait>,
}

impl<K, R: Default> Observed<K, R> {
    pub fn new(current: Vec<K>, expected: Vec<K>) -> Self {
        Self {
            current,
            expected,
            refs: R::default(),
            wait: None,
        }
    }

    /// Stop here for this pass
    pub fn waiting(current: Vec<K>, wait: Wait) -> Self {
        Self {
            current,
            expected: Vec::new(),
            refs: R::default(),
            wait: Some(wait),
        }
    }
}

/// Number of children written by one apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Reconciler for one child kind of `P`
#[async_trait]
pub trait ChildReconciler<P: Managed, S: ObjectStore>: Send + Sync {
    type Child: Object;
    type Refs: Send;

    /// Step name used in logs
    fn name(&self) -> &'static str;

    /// Condition type this step maintains
    fn condition_type(&self) -> &'static str;

    /// List live children and compute the expected ones
    async fn read(
        &self,
        parent: &P,
        ctx: &Context<S>,
    ) -> Result<Observed<Self::Child, Self::Refs>, ReconcilerError>;

    fn diff(
        &self,
        current: Vec<Self::Child>,
        expected: Vec<Self::Child>,
    ) -> Result<Plan<Self::Child>, ReconcilerError> {
        diff::diff(current, expected)
    }

    async fn apply(
        &self,
        ctx: &Context<S>,
        plan: Plan<Self::Child>,
    ) -> Result<Applied, ReconcilerError> {
        Ok(apply_plan(ctx.store.as_ref(), plan).await?)
    }

    /// Runs once the plan is applied, with what `read` looked up
    async fn after_apply(
        &self,
        _parent: &P,
        _ctx: &Context<S>,
        _refs: Self::Refs,
    ) -> Result<(), ReconcilerError> {
        Ok(())
    }

    /// Runs while the parent is being deleted
    async fn on_delete(&self, _parent: &P, _ctx: &Context<S>) -> Result<(), ReconcilerError> {
        Ok(())
    }
}

/// Create missing children, apply changed ones, delete orphans
pub async fn apply_plan<S: ObjectStore, K: Object>(
    store: &S,
    plan: Plan<K>,
) -> Result<Applied, StoreError> {
    let mut applied = Applied::default();
    for obj in &plan.create {
        match store.create(obj).await {
            Ok(_) => {}
            // Another writer got there first; converge onto it
            Err(StoreError::AlreadyExists(_)) => {
                store.apply(obj).await?;
            }
            Err(e) => return Err(e),
        }
        applied.created += 1;
    }
    for obj in &plan.update {
        store.apply(obj).await?;
        applied.updated += 1;
    }
    for obj in &plan.delete {
        store.delete::<K>(&ObjectKey::of(obj)?).await?;
        applied.deleted += 1;
    }
    Ok(applied)
}

/// Children of `parent` of kind `K`, selected by ownership labels
pub async fn list_children<P: Managed, K: Object, S: ObjectStore>(
    parent: &P,
    ctx: &Context<S>,
) -> Result<Vec<K>, StoreError> {
    let namespace = parent.meta().namespace.as_deref().unwrap_or("default");
    ctx.store.list::<K>(namespace, &ownership_labels(parent)).await
}

/// Type-erased pipeline entry
#[async_trait]
pub trait Step<P, S>: Send + Sync {
    fn name(&self) -> &'static str;

    fn condition_type(&self) -> &'static str;

    /// Run the step and record its condition in `status`
    async fn reconcile(
        &self,
        parent: &P,
        ctx: &Context<S>,
        status: &mut ClusterStatus,
    ) -> Result<StepOutcome, ReconcilerError>;

    async fn on_delete(&self, parent: &P, ctx: &Context<S>) -> Result<(), ReconcilerError>;
}

async fn run<P, S, T>(
    step: &T,
    parent: &P,
    ctx: &Context<S>,
) -> Result<(StepOutcome, usize), ReconcilerError>
where
    P: Managed,
    S: ObjectStore,
    T: ChildReconciler<P, S> + ?Sized,
{
    let Observed {
        current,
        expected,
        refs,
        wait,
    } = step.read(parent, ctx).await?;
    if let Some(wait) = wait {
        return Ok((StepOutcome::Wait(wait), 0));
    }

    let name = ChildReconciler::name(step);
    let count = expected.len();
    let plan = step.diff(current, expected)?;
    if plan.is_empty() {
        debug!(step = name, "children up to date");
    } else {
        let applied = step.apply(ctx, plan).await?;
        let child = T::Child::kind(&());
        for (op, n) in [
            ("create", applied.created),
            ("update", applied.updated),
            ("delete", applied.deleted),
        ] {
            if n > 0 {
                ctx.metrics.increment_child_writes(P::COMPONENT, &child, op, n);
            }
        }
        info!(
            step = name,
            created = applied.created,
            updated = applied.updated,
            deleted = applied.deleted,
            "children applied"
        );
    }
    step.after_apply(parent, ctx, refs).await?;
    Ok((StepOutcome::Continue, count))
}

#[async_trait]
impl<P, S, T> Step<P, S> for T
where
    P: Managed,
    S: ObjectStore,
    T: ChildReconciler<P, S>,
{
    fn name(&self) -> &'static str {
        ChildReconciler::name(self)
    }

    fn condition_type(&self) -> &'static str {
        ChildReconciler::condition_type(self)
    }

    async fn reconcile(
        &self,
        parent: &P,
        ctx: &Context<S>,
        status: &mut ClusterStatus,
    ) -> Result<StepOutcome, ReconcilerError> {
        let generation = parent.meta().generation;
        let condition_type = ChildReconciler::condition_type(self);
        match run(self, parent, ctx).await {
            Ok((StepOutcome::Continue, count)) => {
                status.set_condition(Condition::new(
                    condition_type,
                    ConditionStatus::True,
                    "Reconciled",
                    format!("{count} {} reconciled", T::Child::kind(&())),
                    generation,
                ));
                Ok(StepOutcome::Continue)
            }
            Ok((StepOutcome::Wait(wait), _)) => {
                status.set_condition(Condition::new(
                    condition_type,
                    ConditionStatus::False,
                    wait.reason,
                    wait.message.clone(),
                    generation,
                ));
                Ok(StepOutcome::Wait(wait))
            }
            Err(e) => {
                status.set_condition(Condition::new(
                    condition_type,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                    generation,
                ));
                Err(e)
            }
        }
    }

    async fn on_delete(&self, parent: &P, ctx: &Context<S>) -> Result<(), ReconcilerError> {
        ChildReconciler::on_delete(self, parent, ctx).await
    }
}

/// Pure builder for a simple child kind
pub type Builder<P, K> = fn(&P) -> Result<Vec<K>, ReconcilerError>;

/// Step for children that depend only on the parent spec
pub struct BuilderStep<P, K> {
    name: &'static str,
    condition_type: &'static str,
    build: Builder<P, K>,
}

impl<P, K> std::fmt::Debug for BuilderStep<P, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<P, K> BuilderStep<P, K> {
    pub fn new(name: &'static str, condition_type: &'static str, build: Builder<P, K>) -> Self {
        Self {
            name,
            condition_type,
            build,
        }
    }
}

#[async_trait]
impl<P, S, K> ChildReconciler<P, S> for BuilderStep<P, K>
where
    P: Managed,
    S: ObjectStore,
    K: Object,
{
    type Child = K;
    type Refs = ();

    fn name(&self) -> &'static str {
        self.name
    }

    fn condition_type(&self) -> &'static str {
        self.condition_type
    }

    async fn read(&self, parent: &P, ctx: &Context<S>) -> Result<Observed<K>, ReconcilerError> {
        let current = list_children::<P, K, S>(parent, ctx).await?;
        let expected = (self.build)(parent)?;
        Ok(Observed::new(current, expected))
    }
}
