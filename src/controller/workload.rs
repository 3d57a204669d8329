//! # Workloads
//!
//! Deployment and StatefulSet children: checksum annotation of the pod
//! template before apply, and the rollout probe the driver uses for `Ready`.

use crate::controller::checksum;
use crate::controller::context::Context;
use crate::controller::error::ReconcilerError;
use crate::controller::managed::{child_name, Managed};
use crate::controller::step::{list_children, ChildReconciler, Observed, Wait};
use crate::controller::store::{Object, ObjectKey, ObjectStore};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use std::marker::PhantomData;
use tracing::debug;

pub const MISSING_REFERENCE_REASON: &str = "MissingReference";

/// Replica counts of a workload as last reported by its controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollout {
    pub desired: i32,
    pub ready: i32,
    pub rolled_out: bool,
}

impl Rollout {
    pub fn is_ready(&self) -> bool {
        self.rolled_out && self.ready == self.desired
    }
}

/// A child that runs pods from a template
pub trait Workload: Object {
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;

    fn rollout(&self) -> Rollout;
}

fn rolled_out(generation: Option<i64>, observed: Option<i64>, updated: i32, desired: i32) -> bool {
    observed.unwrap_or_default() >= generation.unwrap_or_default() && updated == desired
}

impl Workload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }

    fn rollout(&self) -> Rollout {
        let desired = self
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let Some(status) = &self.status else {
            return Rollout {
                desired,
                ..Default::default()
            };
        };
        let updated = status.updated_replicas.unwrap_or_default();
        Rollout {
            desired,
            ready: status.ready_replicas.unwrap_or_default(),
            rolled_out: rolled_out(
                self.metadata.generation,
                status.observed_generation,
                updated,
                desired,
            ),
        }
    }
}

impl Workload for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }

    fn rollout(&self) -> Rollout {
        let desired = self
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let Some(status) = &self.status else {
            return Rollout {
                desired,
                ..Default::default()
            };
        };
        let updated = status.updated_replicas.unwrap_or_default();
        Rollout {
            desired,
            ready: status.ready_replicas.unwrap_or_default(),
            rolled_out: rolled_out(
                self.metadata.generation,
                status.observed_generation,
                updated,
                desired,
            ),
        }
    }
}

/// Builds the single workload of a parent
pub type WorkloadBuilder<P, W> = fn(&P) -> Result<W, ReconcilerError>;

/// Step applying a workload once every blob it references exists
pub struct WorkloadStep<P, W> {
    name: &'static str,
    condition_type: &'static str,
    build: WorkloadBuilder<P, W>,
}

impl<P, W> std::fmt::Debug for WorkloadStep<P, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<P, W> WorkloadStep<P, W> {
    pub fn new(
        name: &'static str,
        condition_type: &'static str,
        build: WorkloadBuilder<P, W>,
    ) -> Self {
        Self {
            name,
            condition_type,
            build,
        }
    }
}

#[async_trait]
impl<P, S, W> ChildReconciler<P, S> for WorkloadStep<P, W>
where
    P: Managed,
    S: ObjectStore,
    W: Workload,
{
    type Child = W;
    type Refs = ();

    fn name(&self) -> &'static str {
        self.name
    }

    fn condition_type(&self) -> &'static str {
        self.condition_type
    }

    async fn read(&self, parent: &P, ctx: &Context<S>) -> Result<Observed<W>, ReconcilerError> {
        let current = list_children::<P, W, S>(parent, ctx).await?;
        let mut workload = (self.build)(parent)?;
        let namespace = parent.meta().namespace.as_deref().unwrap_or("default");

        let refs = workload
            .pod_template()
            .and_then(|template| template.spec.as_ref())
            .map(checksum::pod_references)
            .unwrap_or_default();

        let Some(checksums) = checksum::collect(ctx.store.as_ref(), namespace, &refs).await? else {
            let missing = checksum::missing(ctx.store.as_ref(), namespace, &refs).await?;
            debug!(step = self.name, missing = ?missing, "workload references missing");
            return Ok(Observed::waiting(
                current,
                Wait {
                    after: ctx.config.dependency_poll(),
                    reason: MISSING_REFERENCE_REASON,
                    message: format!("waiting for {}", missing.join(", ")),
                },
            ));
        };

        if let Some(template) = workload.pod_template_mut() {
            checksum::annotate(template, checksums);
        }
        Ok(Observed::new(current, vec![workload]))
    }
}

/// Workload rollout state for the aggregated `Ready` condition
#[async_trait]
pub trait Readiness<P, S>: Send + Sync {
    async fn probe(&self, parent: &P, ctx: &Context<S>) -> Result<Rollout, ReconcilerError>;
}

/// Reads the workload named `<parent>-<suffix>`
pub struct WorkloadProbe<W> {
    suffix: &'static str,
    _workload: PhantomData<fn() -> W>,
}

impl<W> std::fmt::Debug for WorkloadProbe<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadProbe")
            .field("suffix", &self.suffix)
            .finish()
    }
}

impl<W> WorkloadProbe<W> {
    pub fn new(suffix: &'static str) -> Self {
        Self {
            suffix,
            _workload: PhantomData,
        }
    }
}

#[async_trait]
impl<P, S, W> Readiness<P, S> for WorkloadProbe<W>
where
    P: Managed,
    S: ObjectStore,
    W: Workload,
{
    async fn probe(&self, parent: &P, ctx: &Context<S>) -> Result<Rollout, ReconcilerError> {
        let key = ObjectKey::new(
            parent.meta().namespace.as_deref().unwrap_or("default"),
            child_name(parent, self.suffix),
        );
        Ok(ctx
            .store
            .get::<W>(&key)
            .await?
            .map(|workload| workload.rollout())
            .unwrap_or_default())
    }
}
