//! # Managed Resources
//!
//! What the engine needs to know about a top-level resource, and the
//! metadata every child carries back to it.

use crate::constants::{CLUSTER_LABEL, COMPONENT_LABEL, FIELD_MANAGER, MANAGED_BY_LABEL};
use crate::controller::store::Object;
use crate::crd::ClusterStatus;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// A resource reconciled by a [`Driver`](crate::controller::Driver)
pub trait Managed: Object {
    /// Component label value and metric `kind` label (`kibana`, `logstash`)
    const COMPONENT: &'static str;

    /// Finalizer the driver places on the resource itself
    const FINALIZER: &'static str;

    fn cluster_status(&self) -> Option<&ClusterStatus>;

    /// Externally reachable URL, when one is exposed
    fn url(&self) -> Option<String> {
        None
    }
}

/// `<parent>-<suffix>`
pub fn child_name<P: Managed>(parent: &P, suffix: &str) -> String {
    format!("{}-{suffix}", parent.meta().name.as_deref().unwrap_or_default())
}

/// Labels selecting every child of `parent`
pub fn ownership_labels<P: Managed>(parent: &P) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            CLUSTER_LABEL.to_string(),
            parent.meta().name.clone().unwrap_or_default(),
        ),
        (COMPONENT_LABEL.to_string(), P::COMPONENT.to_string()),
    ])
}

/// Labels carried by children, selectors included
pub fn child_labels<P: Managed>(parent: &P) -> BTreeMap<String, String> {
    let mut labels = ownership_labels(parent);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Metadata of a same-namespace child owned by `parent`
pub fn child_meta<P: Managed>(parent: &P, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: parent.meta().namespace.clone(),
        labels: Some(child_labels(parent)),
        owner_references: parent.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}
