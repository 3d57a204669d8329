//! # LogstashPipeline
//!
//! A pipeline contributed to a `Logstash` living anywhere in the cluster.
//! It has no controller of its own: the referenced `Logstash` places a
//! finalizer on it and releases it once the contribution is dropped.

use serde::{Deserialize, Serialize};

/// LogstashPipeline Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: stack.octopilot.io/v1
/// kind: LogstashPipeline
/// metadata:
///   name: nginx
///   namespace: team-web
/// spec:
///   logstashRef:
///     name: shipper
///     namespace: observability
///   pipeline: |
///     input { http { port => 8080 } }
///     output { elasticsearch { hosts => ["${ELASTICSEARCH_HOSTS}"] } }
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "LogstashPipeline",
    group = "stack.octopilot.io",
    version = "v1",
    namespaced,
    shortname = "lsp",
    printcolumn = r#"{"name":"Logstash", "type":"string", "jsonPath":".spec.logstashRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogstashPipelineSpec {
    /// Target Logstash
    pub logstash_ref: LogstashRef,
    /// Pipeline definition
    pub pipeline: String,
    #[serde(default)]
    pub workers: Option<i32>,
}

/// Reference to a `Logstash`; namespace defaults to the pipeline's own
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LogstashRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl LogstashPipeline {
    /// `namespace/name` of the referenced Logstash
    pub fn target(&self) -> String {
        let namespace = self
            .spec
            .logstash_ref
            .namespace
            .as_deref()
            .or(self.metadata.namespace.as_deref())
            .unwrap_or("default");
        format!("{namespace}/{}", self.spec.logstash_ref.name)
    }

    /// Pipeline id as it appears in `pipelines.yml`
    pub fn pipeline_id(&self) -> String {
        format!(
            "{}-{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(namespace: &str, target_namespace: Option<&str>) -> LogstashPipeline {
        let mut pipeline = LogstashPipeline::new(
            "nginx",
            LogstashPipelineSpec {
                logstash_ref: LogstashRef {
                    name: "shipper".to_string(),
                    namespace: target_namespace.map(str::to_string),
                },
                pipeline: "input {}".to_string(),
                workers: None,
            },
        );
        pipeline.metadata.namespace = Some(namespace.to_string());
        pipeline
    }

    #[test]
    fn test_target_defaults_to_own_namespace() {
        assert_eq!(pipeline("web", None).target(), "web/shipper");
        assert_eq!(pipeline("web", Some("obs")).target(), "obs/shipper");
    }

    #[test]
    fn test_pipeline_id_is_namespace_qualified() {
        assert_eq!(pipeline("web", Some("obs")).pipeline_id(), "web-nginx");
    }
}
