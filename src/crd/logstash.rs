//! # Logstash
//!
//! `Logstash` custom resource definition.

use crate::crd::common::{default_replicas, ElasticsearchRef, PdbSpec, PodSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logstash Custom Resource Definition
///
/// Describes one Logstash StatefulSet. Pipelines come from `spec.pipelines`
/// and from every `LogstashPipeline` whose `logstashRef` points here,
/// in any namespace.
///
/// # Example
///
/// ```yaml
/// apiVersion: stack.octopilot.io/v1
/// kind: Logstash
/// metadata:
///   name: shipper
///   namespace: observability
/// spec:
///   version: 8.15.0
///   elasticsearchRef:
///     hosts: ["https://es-http:9200"]
///     credentialsSecret: es-logstash-user
///   pipelines:
///     - id: beats
///       config: |
///         input { beats { port => 5044 } }
///         output { elasticsearch { hosts => ["${ELASTICSEARCH_HOSTS}"] } }
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Logstash",
    group = "stack.octopilot.io",
    version = "v1",
    namespaced,
    status = "crate::crd::ClusterStatus",
    shortname = "ls",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogstashSpec {
    /// Logstash version, used to derive the default image
    pub version: String,
    /// Container image; defaults to `docker.elastic.co/logstash/logstash:<version>`
    #[serde(default)]
    pub image: Option<String>,
    /// Number of Logstash pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Extra `logstash.yml` settings, flat dotted keys (`pipeline.batch.size`)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Inline pipelines
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
    /// Elasticsearch the pipelines ship to
    #[serde(default)]
    pub elasticsearch_ref: Option<ElasticsearchRef>,
    /// Disruption budget; created when set or when `replicas > 1`
    #[serde(default)]
    pub pod_disruption_budget: Option<PdbSpec>,
    /// Pod-level settings for the Logstash container
    #[serde(default)]
    pub pod: PodSettings,
}

/// Inline pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Pipeline id, unique within the Logstash
    pub id: String,
    /// Pipeline definition (`input {} filter {} output {}`)
    pub config: String,
    #[serde(default)]
    pub workers: Option<i32>,
}

impl LogstashSpec {
    /// Image to run
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("docker.elastic.co/logstash/logstash:{}", self.version))
    }
}
