//! # Kibana
//!
//! `Kibana` custom resource definition.

use crate::crd::common::{default_replicas, ElasticsearchRef, EndpointSpec, PdbSpec, PodSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kibana Custom Resource Definition
///
/// Describes one Kibana deployment. The operator renders `kibana.yml`,
/// generates the encryption keys, and exposes the UI through a Service and
/// an optional Ingress.
///
/// # Example
///
/// ```yaml
/// apiVersion: stack.octopilot.io/v1
/// kind: Kibana
/// metadata:
///   name: logs
///   namespace: observability
/// spec:
///   version: 8.15.0
///   replicas: 2
///   elasticsearchRef:
///     hosts: ["https://es-http:9200"]
///     credentialsSecret: es-kibana-user
///   endpoint:
///     ingress:
///       enabled: true
///       host: kibana.example.com
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Kibana",
    group = "stack.octopilot.io",
    version = "v1",
    namespaced,
    status = "crate::crd::ClusterStatus",
    shortname = "kb",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"URL", "type":"string", "jsonPath":".status.url"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KibanaSpec {
    /// Kibana version, used to derive the default image
    pub version: String,
    /// Container image; defaults to `docker.elastic.co/kibana/kibana:<version>`
    #[serde(default)]
    pub image: Option<String>,
    /// Number of Kibana pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Extra `kibana.yml` settings, flat dotted keys (`server.basePath`)
    /// Values are parsed as YAML scalars so `"true"` renders as a boolean
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Elasticsearch the UI connects to
    #[serde(default)]
    pub elasticsearch_ref: Option<ElasticsearchRef>,
    /// Secret mounted as the Kibana keystore
    #[serde(default)]
    pub keystore_secret: Option<String>,
    /// Exposure through an Ingress or a LoadBalancer Service
    #[serde(default)]
    pub endpoint: EndpointSpec,
    /// Disruption budget; created when set or when `replicas > 1`
    #[serde(default)]
    pub pod_disruption_budget: Option<PdbSpec>,
    /// Pod-level settings for the Kibana container
    #[serde(default)]
    pub pod: PodSettings,
}

impl KibanaSpec {
    /// Image to run
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("docker.elastic.co/kibana/kibana:{}", self.version))
    }
}
