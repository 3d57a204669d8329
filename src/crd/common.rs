//! # Shared Spec Types
//!
//! Fragments shared by the `Kibana` and `Logstash` specs.
//!
//! These are deliberately narrower than the core `k8s-openapi` types so the
//! generated CRD schemas stay small and structural.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection details for the Elasticsearch cluster a component talks to
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchRef {
    /// Elasticsearch endpoints, e.g. `https://es-http:9200`
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Name of a Secret in the same namespace holding `username` and `password`
    #[serde(default)]
    pub credentials_secret: Option<String>,
    /// Name of a Secret in the same namespace holding `ca.crt`
    #[serde(default)]
    pub ca_secret: Option<String>,
}

/// Single environment variable injected into the main container
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_from: Option<EnvVarSource>,
}

/// Source of an environment variable value
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default)]
    pub secret_key_ref: Option<KeySelector>,
    #[serde(default)]
    pub config_map_key_ref: Option<KeySelector>,
}

/// Reference to one key of a Secret or ConfigMap in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct KeySelector {
    pub name: String,
    pub key: String,
}

/// Bulk injection of every key of a Secret or ConfigMap
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<NameRef>,
    #[serde(default)]
    pub config_map_ref: Option<NameRef>,
}

/// Reference to an object by name in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct NameRef {
    pub name: String,
}

/// Compute resources for the main container
///
/// Quantities are passed through verbatim (`"500m"`, `"1Gi"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct Resources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// How the component is exposed outside the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[serde(default)]
    pub ingress: Option<IngressSpec>,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerSpec>,
}

/// Ingress route in front of the component Service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Required when `enabled` is true
    #[serde(default)]
    pub host: Option<String>,
    /// Defaults to `/`
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub ingress_class_name: Option<String>,
    /// TLS secret for `host`; when set the exposed URL uses https
    #[serde(default)]
    pub tls_secret: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl IngressSpec {
    /// An ingress that is switched on
    pub fn is_enabled(spec: Option<&Self>) -> Option<&Self> {
        spec.filter(|ingress| ingress.enabled)
    }
}

/// Turns the component Service into a `LoadBalancer`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// PodDisruptionBudget settings
///
/// When neither bound is given the budget allows one unavailable pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdbSpec {
    #[serde(default)]
    pub min_available: Option<i32>,
    #[serde(default)]
    pub max_unavailable: Option<i32>,
}

/// Pod-level knobs shared by both workloads
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSettings {
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account_name: Option<String>,
}

impl PodSettings {
    /// Names of every Secret referenced from `env` and `envFrom`, in declaration order
    pub fn secret_names(&self) -> Vec<&str> {
        let from_env = self.env.iter().filter_map(|var| {
            var.value_from
                .as_ref()
                .and_then(|source| source.secret_key_ref.as_ref())
                .map(|selector| selector.name.as_str())
        });
        let from_env_from = self
            .env_from
            .iter()
            .filter_map(|source| source.secret_ref.as_ref().map(|r| r.name.as_str()));
        from_env.chain(from_env_from).collect()
    }

    /// Names of every ConfigMap referenced from `env` and `envFrom`, in declaration order
    pub fn config_map_names(&self) -> Vec<&str> {
        let from_env = self.env.iter().filter_map(|var| {
            var.value_from
                .as_ref()
                .and_then(|source| source.config_map_key_ref.as_ref())
                .map(|selector| selector.name.as_str())
        });
        let from_env_from = self
            .env_from
            .iter()
            .filter_map(|source| source.config_map_ref.as_ref().map(|r| r.name.as_str()));
        from_env.chain(from_env_from).collect()
    }
}

/// Default replica count
pub fn default_replicas() -> i32 {
    1
}
