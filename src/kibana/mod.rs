//! # Kibana
//!
//! Step pipeline for `Kibana` resources:
//!
//! 1. `ConfigMap` `<name>-kb-config` with `kibana.yml`
//! 2. `Secret` `<name>-kb-credentials` with generated encryption keys
//! 3. `Service` `<name>-kb`
//! 4. `Deployment` `<name>-kb`, rolled on referenced data changes
//! 5. `Ingress` `<name>-kb` when the ingress endpoint is enabled
//! 6. `PodDisruptionBudget` `<name>-kb` when configured or replicated

pub mod builder;

use crate::constants::KIBANA_FINALIZER;
use crate::controller::managed::{child_name, Managed};
use crate::controller::step::list_children;
use crate::controller::{
    BuilderStep, ChildReconciler, Context, Driver, FieldIndex, ObjectKey, ObjectStore, Observed,
    ReconcilerError, WorkloadProbe, WorkloadStep,
};
use crate::crd::{ClusterStatus, IngressSpec, Kibana};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;

/// Secrets referenced by a Kibana, as `namespace/name`
pub const SECRETS_INDEX: &str = "kibana.secrets";
/// ConfigMaps referenced by a Kibana, as `namespace/name`
pub const CONFIG_MAPS_INDEX: &str = "kibana.configmaps";

impl Managed for Kibana {
    const COMPONENT: &'static str = "kibana";
    const FINALIZER: &'static str = KIBANA_FINALIZER;

    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }

    fn url(&self) -> Option<String> {
        let ingress = IngressSpec::is_enabled(self.spec.endpoint.ingress.as_ref())?;
        let host = ingress.host.as_deref().filter(|host| !host.is_empty())?;
        let scheme = if ingress.tls_secret.is_some() {
            "https"
        } else {
            "http"
        };
        Some(format!("{scheme}://{host}"))
    }
}

/// Generated credentials; reads the live Secret so keys are never rotated
#[derive(Debug, Default)]
pub struct CredentialsStep;

#[async_trait]
impl<S: ObjectStore> ChildReconciler<Kibana, S> for CredentialsStep {
    type Child = Secret;
    type Refs = ();

    fn name(&self) -> &'static str {
        "credentials"
    }

    fn condition_type(&self) -> &'static str {
        "CredentialsReady"
    }

    async fn read(&self, kb: &Kibana, ctx: &Context<S>) -> Result<Observed<Secret>, ReconcilerError> {
        let current = list_children::<Kibana, Secret, S>(kb, ctx).await?;
        let key = ObjectKey::new(
            kb.meta().namespace.as_deref().unwrap_or("default"),
            child_name(kb, builder::CREDENTIALS_SUFFIX),
        );
        let existing = ctx.store.get::<Secret>(&key).await?;
        let expected = vec![builder::credentials_secret(kb, existing.as_ref())];
        Ok(Observed::new(current, expected))
    }
}

fn qualified(kb: &Kibana, names: impl IntoIterator<Item = String>) -> Vec<String> {
    let namespace = kb.meta().namespace.as_deref().unwrap_or("default");
    let mut values: Vec<String> = names
        .into_iter()
        .map(|name| format!("{namespace}/{name}"))
        .collect();
    values.sort();
    values.dedup();
    values
}

/// Every Secret the Kibana pods depend on
pub fn secret_refs(kb: &Kibana) -> Vec<String> {
    let es = kb.spec.elasticsearch_ref.as_ref();
    let names = [
        kb.spec.keystore_secret.clone(),
        es.and_then(|es| es.credentials_secret.clone()),
        es.and_then(|es| es.ca_secret.clone()),
        kb.spec
            .endpoint
            .ingress
            .as_ref()
            .and_then(|ingress| ingress.tls_secret.clone()),
    ]
    .into_iter()
    .flatten()
    .chain(kb.spec.pod.secret_names().into_iter().map(str::to_string));
    qualified(kb, names)
}

pub fn config_map_refs(kb: &Kibana) -> Vec<String> {
    qualified(
        kb,
        kb.spec.pod.config_map_names().into_iter().map(str::to_string),
    )
}

pub fn field_index() -> FieldIndex<Kibana> {
    FieldIndex::new()
        .with_index(SECRETS_INDEX, secret_refs)
        .with_index(CONFIG_MAPS_INDEX, config_map_refs)
}

/// The Kibana pipeline, in reconcile order
pub fn driver<S: ObjectStore>(ctx: Context<S>) -> Driver<Kibana, S> {
    Driver::new(ctx, WorkloadProbe::<Deployment>::new(builder::HTTP_SUFFIX))
        .with_step(BuilderStep::new(
            "configmap",
            "ConfigMapReady",
            builder::config_map,
        ))
        .with_step(CredentialsStep)
        .with_step(BuilderStep::new("service", "ServiceReady", builder::service))
        .with_step(WorkloadStep::new(
            "deployment",
            "DeploymentReady",
            builder::deployment,
        ))
        .with_step(BuilderStep::new(
            "ingress",
            "IngressReady",
            builder::ingress_route,
        ))
        .with_step(BuilderStep::new(
            "pdb",
            "PodDisruptionBudgetReady",
            builder::disruption_budget,
        ))
}
