//! # Reconcile Driver
//!
//! Runs the step pipeline of one managed resource kind.
//!
//! ## Pass Flow
//!
//! 1. **Load**: a resource that no longer exists is done
//! 2. **Delete**: step delete hooks in reverse order, release foreign
//!    finalizers, then drop our own finalizer once nothing is held
//! 3. **Configure**: add our finalizer, seed missing conditions, register
//!    the per-instance metric series
//! 4. **Steps**: strictly in order; a wait halts the rest of the pass
//! 5. **Aggregate**: `Ready`, phase and observed generation from the step
//!    results and the workload rollout
//! 6. **Status**: one status patch, skipped when nothing changed

use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::finalizer::ForeignFinalizers;
use crate::controller::managed::Managed;
use crate::controller::step::{Step, StepOutcome, Wait};
use crate::controller::store::{has_finalizer, is_deleting, ObjectKey, ObjectStore};
use crate::controller::workload::Readiness;
use crate::crd::{ClusterStatus, Condition, ConditionStatus, Phase, READY_CONDITION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

const ROLLING_OUT_REASON: &str = "RollingOut";

/// What the scheduler should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

/// Orchestrates the steps of one managed kind
pub struct Driver<P, S> {
    ctx: Context<S>,
    steps: Vec<Box<dyn Step<P, S>>>,
    trackers: Vec<Arc<dyn ForeignFinalizers<P, S>>>,
    readiness: Box<dyn Readiness<P, S>>,
}

impl<P, S> std::fmt::Debug for Driver<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("trackers", &self.trackers.len())
            .finish_non_exhaustive()
    }
}

impl<P: Managed, S: ObjectStore> Driver<P, S> {
    pub fn new(ctx: Context<S>, readiness: impl Readiness<P, S> + 'static) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
            trackers: Vec::new(),
            readiness: Box::new(readiness),
        }
    }

    /// Append a step; steps run in the order they are added
    #[must_use]
    pub fn with_step(mut self, step: impl Step<P, S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn ForeignFinalizers<P, S>>) -> Self {
        self.trackers.push(tracker);
        self
    }

    pub fn context(&self) -> &Context<S> {
        &self.ctx
    }

    /// Condition types seeded on first sight: one per step, then `Ready`
    pub fn condition_types(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .map(|step| step.condition_type())
            .chain(std::iter::once(READY_CONDITION))
            .collect()
    }

    /// Run one pass for `key`
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        let span = info_span!(
            "reconcile",
            kind = P::COMPONENT,
            resource.namespace = %key.namespace,
            resource.name = %key.name,
        );
        async move {
            let started = Instant::now();
            let result = self.reconcile_inner(key).await;
            let label = match &result {
                Ok(ReconcileOutcome::Done) => "success",
                Ok(ReconcileOutcome::RequeueAfter(_)) => "requeue",
                Err(_) => "error",
            };
            self.ctx
                .metrics
                .observe_reconcile(P::COMPONENT, label, started.elapsed());
            result
        }
        .instrument(span)
        .await
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        let Some(parent) = self.ctx.store.get::<P>(key).await? else {
            debug!("resource no longer exists");
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&parent) {
            return self.finalize(&parent, key).await;
        }

        self.ensure_finalizer(&parent, key).await?;

        let before = parent.cluster_status().cloned();
        let mut status = before.clone().unwrap_or_default();
        status.seed_conditions(&self.condition_types(), parent.meta().generation);
        self.ctx
            .metrics
            .init_instance(P::COMPONENT, &key.namespace, &key.name);

        let result = match self.run_steps(&parent, &mut status).await {
            Ok(StepOutcome::Continue) => self.on_success(&parent, key, &mut status).await,
            Ok(StepOutcome::Wait(wait)) => Ok(self.on_wait(&parent, key, &mut status, wait)),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.on_error(&parent, key, &mut status, e);
        }

        let written = self.write_status(key, before.as_ref(), &status).await;
        match (result, written) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => {
                // The failed condition cannot be persisted, only counted
                error!(error = %e, reason = e.reason(), "status write failed");
                self.ctx.metrics.increment_errors(P::COMPONENT, e.reason());
                self.ctx
                    .metrics
                    .set_ready(P::COMPONENT, &key.namespace, &key.name, false);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(write_error)) => {
                warn!(error = %write_error, "status write failed after reconcile error");
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        parent: &P,
        status: &mut ClusterStatus,
    ) -> Result<StepOutcome, ReconcilerError> {
        for step in &self.steps {
            let outcome = step.reconcile(parent, &self.ctx, status).await?;
            if let StepOutcome::Wait(wait) = outcome {
                info!(
                    step = step.name(),
                    reason = wait.reason,
                    retry_secs = wait.after.as_secs(),
                    "step waiting"
                );
                return Ok(StepOutcome::Wait(wait));
            }
        }
        Ok(StepOutcome::Continue)
    }

    async fn on_success(
        &self,
        parent: &P,
        key: &ObjectKey,
        status: &mut ClusterStatus,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let rollout = self.readiness.probe(parent, &self.ctx).await?;
        let ready = rollout.is_ready();
        let generation = parent.meta().generation;
        let (condition_status, reason) = if ready {
            (ConditionStatus::True, "Ready")
        } else {
            (ConditionStatus::False, ROLLING_OUT_REASON)
        };
        status.set_condition(Condition::new(
            READY_CONDITION,
            condition_status,
            reason,
            format!("{}/{} replicas ready", rollout.ready, rollout.desired),
            generation,
        ));
        status.phase = if ready { Phase::Running } else { Phase::Starting };
        status.observed_generation = std::cmp::max(status.observed_generation, generation);
        status.is_on_error = false;
        status.url = parent.url();
        self.ctx
            .metrics
            .set_ready(P::COMPONENT, &key.namespace, &key.name, ready);

        if ready {
            Ok(ReconcileOutcome::Done)
        } else {
            self.ctx
                .metrics
                .increment_requeues(P::COMPONENT, ROLLING_OUT_REASON);
            Ok(ReconcileOutcome::RequeueAfter(self.ctx.config.readiness_poll()))
        }
    }

    fn on_wait(
        &self,
        parent: &P,
        key: &ObjectKey,
        status: &mut ClusterStatus,
        wait: Wait,
    ) -> ReconcileOutcome {
        status.set_condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            wait.reason,
            wait.message,
            parent.meta().generation,
        ));
        status.phase = Phase::Starting;
        status.is_on_error = false;
        self.ctx
            .metrics
            .set_ready(P::COMPONENT, &key.namespace, &key.name, false);
        self.ctx.metrics.increment_requeues(P::COMPONENT, wait.reason);
        ReconcileOutcome::RequeueAfter(wait.after)
    }

    fn on_error(&self, parent: &P, key: &ObjectKey, status: &mut ClusterStatus, e: &ReconcilerError) {
        error!(error = %e, reason = e.reason(), "reconcile failed");
        status.set_condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            e.reason(),
            e.to_string(),
            parent.meta().generation,
        ));
        status.phase = Phase::Error;
        status.is_on_error = true;
        self.ctx.metrics.increment_errors(P::COMPONENT, e.reason());
        self.ctx
            .metrics
            .set_ready(P::COMPONENT, &key.namespace, &key.name, false);
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        before: Option<&ClusterStatus>,
        status: &ClusterStatus,
    ) -> Result<(), ReconcilerError> {
        if before == Some(status) {
            debug!("status unchanged");
            return Ok(());
        }
        let value = serde_json::to_value(status)
            .map_err(|e| ReconcilerError::internal("serialize status", e))?;
        self.ctx.store.patch_status::<P>(key, &value).await?;
        debug!(phase = %status.phase, "status updated");
        Ok(())
    }

    async fn ensure_finalizer(&self, parent: &P, key: &ObjectKey) -> Result<(), ReconcilerError> {
        if has_finalizer(parent, P::FINALIZER) {
            return Ok(());
        }
        let mut finalizers = parent.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(P::FINALIZER.to_string());
        self.ctx.store.set_finalizers::<P>(key, &finalizers).await?;
        debug!(finalizer = P::FINALIZER, "finalizer added");
        Ok(())
    }

    async fn finalize(&self, parent: &P, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        info!("finalizing deleted resource");
        for step in self.steps.iter().rev() {
            step.on_delete(parent, &self.ctx).await?;
        }

        let mut remaining = 0;
        for tracker in &self.trackers {
            tracker.release_all(parent, &self.ctx).await?;
            remaining += tracker.remaining(parent, &self.ctx).await?;
        }
        if remaining > 0 {
            info!(remaining, "foreign finalizers still held");
            return Ok(ReconcileOutcome::RequeueAfter(self.ctx.config.dependency_poll()));
        }

        for tracker in &self.trackers {
            tracker.forget(key);
        }
        self.ctx
            .metrics
            .forget_instance(P::COMPONENT, &key.namespace, &key.name);

        if has_finalizer(parent, P::FINALIZER) {
            let finalizers: Vec<String> = parent
                .meta()
                .finalizers
                .iter()
                .flatten()
                .filter(|f| f.as_str() != P::FINALIZER)
                .cloned()
                .collect();
            self.ctx.store.set_finalizers::<P>(key, &finalizers).await?;
            info!(finalizer = P::FINALIZER, "finalizer removed");
        }
        Ok(ReconcileOutcome::Done)
    }
}
