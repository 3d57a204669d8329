//! Shared fixtures for the reconcile tests: a `MemoryStore`-backed context,
//! YAML resource fixtures and helpers standing in for other controllers.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::de::DeserializeOwned;
use stack_operator::config::ControllerConfig;
use stack_operator::controller::store::{Write, WriteOp};
use stack_operator::controller::{Context, MemoryStore, ObjectKey};
use stack_operator::observability::Metrics;
use std::sync::Arc;

pub const NAMESPACE: &str = "obs";

pub fn context() -> Context<MemoryStore> {
    Context::new(
        Arc::new(MemoryStore::new()),
        Arc::new(Metrics::new().expect("metrics registry")),
        Arc::new(ControllerConfig::default()),
    )
}

pub fn from_yaml<K: DeserializeOwned>(yaml: &str) -> K {
    serde_yaml::from_str(yaml).expect("fixture should deserialize")
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Secret with string values, as a user would create it
pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Recorded writes rendered as `Op Kind namespace/name`
pub fn writes(store: &MemoryStore) -> Vec<String> {
    store.writes().iter().map(ToString::to_string).collect()
}

pub fn writes_of(store: &MemoryStore, op: WriteOp) -> Vec<Write> {
    store.writes().into_iter().filter(|w| w.op == op).collect()
}

/// Report every replica of a Deployment ready, as the Deployment controller would
pub fn mark_deployment_ready(store: &MemoryStore, key: &ObjectKey) {
    let deployment: Deployment = store.object(key).expect("deployment should exist");
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    assert!(store.set_status::<Deployment>(
        key,
        serde_json::json!({
            "observedGeneration": deployment.metadata.generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "updatedReplicas": replicas,
        }),
    ));
}

/// Report every replica of a StatefulSet ready
pub fn mark_stateful_set_ready(store: &MemoryStore, key: &ObjectKey) {
    let stateful_set: StatefulSet = store.object(key).expect("statefulset should exist");
    let replicas = stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    assert!(store.set_status::<StatefulSet>(
        key,
        serde_json::json!({
            "observedGeneration": stateful_set.metadata.generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "updatedReplicas": replicas,
        }),
    ));
}

/// Pod template annotations of a workload
pub fn template_annotations(
    template: Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
) -> std::collections::BTreeMap<String, String> {
    template
        .and_then(|template| template.metadata.as_ref())
        .and_then(|meta| meta.annotations.clone())
        .unwrap_or_default()
}
