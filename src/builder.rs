//! # Builder Helpers
//!
//! Pieces of child manifests shared by the Kibana and Logstash builders.
//! Everything here is a pure function of the parent spec.

use crate::controller::managed::{child_labels, child_meta, child_name, ownership_labels, Managed};
use crate::controller::ReconcilerError;
use crate::crd::{EnvFromSource, EnvVar, PdbSpec, PodSettings, Resources};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, ConfigMapKeySelector, EnvFromSource as KubeEnvFromSource,
    EnvVar as KubeEnvVar, EnvVarSource, ResourceRequirements, SecretEnvSource, SecretKeySelector,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Selector matching the pods of `parent`
pub fn pod_selector<P: Managed>(parent: &P) -> LabelSelector {
    LabelSelector {
        match_labels: Some(ownership_labels(parent)),
        ..Default::default()
    }
}

/// Labels stamped on the pod template
pub fn pod_labels<P: Managed>(parent: &P) -> BTreeMap<String, String> {
    child_labels(parent)
}

pub fn plain_env(name: &str, value: impl Into<String>) -> KubeEnvVar {
    KubeEnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> KubeEnvVar {
    KubeEnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn user_env(var: &EnvVar) -> KubeEnvVar {
    let value_from = var.value_from.as_ref().map(|source| EnvVarSource {
        secret_key_ref: source
            .secret_key_ref
            .as_ref()
            .map(|selector| SecretKeySelector {
                name: selector.name.clone(),
                key: selector.key.clone(),
                ..Default::default()
            }),
        config_map_key_ref: source
            .config_map_key_ref
            .as_ref()
            .map(|selector| ConfigMapKeySelector {
                name: selector.name.clone(),
                key: selector.key.clone(),
                ..Default::default()
            }),
        ..Default::default()
    });
    KubeEnvVar {
        name: var.name.clone(),
        value: var.value.clone(),
        value_from,
    }
}

fn user_env_from(source: &EnvFromSource) -> KubeEnvFromSource {
    KubeEnvFromSource {
        prefix: source.prefix.clone(),
        secret_ref: source.secret_ref.as_ref().map(|r| SecretEnvSource {
            name: r.name.clone(),
            ..Default::default()
        }),
        config_map_ref: source.config_map_ref.as_ref().map(|r| ConfigMapEnvSource {
            name: r.name.clone(),
            ..Default::default()
        }),
    }
}

/// Operator-managed variables first, then the user's own
///
/// A user variable with the same name as a managed one is rejected: the
/// container would otherwise carry the name twice.
pub fn container_env(
    managed: Vec<KubeEnvVar>,
    settings: &PodSettings,
) -> Result<Vec<KubeEnvVar>, ReconcilerError> {
    let mut env = managed;
    for var in &settings.env {
        if env.iter().any(|existing| existing.name == var.name) {
            return Err(ReconcilerError::InvalidSpec(format!(
                "env variable {} is managed by the operator",
                var.name
            )));
        }
        env.push(user_env(var));
    }
    Ok(env)
}

pub fn container_env_from(settings: &PodSettings) -> Option<Vec<KubeEnvFromSource>> {
    (!settings.env_from.is_empty())
        .then(|| settings.env_from.iter().map(user_env_from).collect())
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!values.is_empty()).then(|| {
        values
            .iter()
            .map(|(name, value)| (name.clone(), Quantity(value.clone())))
            .collect()
    })
}

pub fn resources(resources: Option<&Resources>) -> Option<ResourceRequirements> {
    resources.map(|resources| ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

pub fn node_selector(settings: &PodSettings) -> Option<BTreeMap<String, String>> {
    (!settings.node_selector.is_empty()).then(|| settings.node_selector.clone())
}

/// Budget `<parent>-<suffix>`, present when configured or when there is more than one pod
pub fn pod_disruption_budget<P: Managed>(
    parent: &P,
    suffix: &str,
    spec: Option<&PdbSpec>,
    replicas: i32,
) -> Result<Vec<PodDisruptionBudget>, ReconcilerError> {
    if spec.is_none() && replicas <= 1 {
        return Ok(Vec::new());
    }
    let spec = spec.cloned().unwrap_or_default();
    let (min_available, max_unavailable) = match (spec.min_available, spec.max_unavailable) {
        (Some(_), Some(_)) => {
            return Err(ReconcilerError::InvalidSpec(
                "podDisruptionBudget sets both minAvailable and maxUnavailable".to_string(),
            ))
        }
        (Some(min), None) => (Some(IntOrString::Int(min)), None),
        (None, Some(max)) => (None, Some(IntOrString::Int(max))),
        (None, None) => (None, Some(IntOrString::Int(1))),
    };
    Ok(vec![PodDisruptionBudget {
        metadata: child_meta(parent, child_name(parent, suffix)),
        spec: Some(PodDisruptionBudgetSpec {
            min_available,
            max_unavailable,
            selector: Some(pod_selector(parent)),
            ..Default::default()
        }),
        ..Default::default()
    }])
}

/// Parse a flat setting value as a YAML scalar, falling back to a string
pub fn yaml_scalar(value: &str) -> serde_yaml::Value {
    match serde_yaml::from_str::<serde_yaml::Value>(value) {
        Ok(parsed @ (serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_))) => parsed,
        _ => serde_yaml::Value::String(value.to_string()),
    }
}

/// Render a flat settings map as a YAML document with sorted keys
pub fn render_yaml(
    settings: &BTreeMap<String, serde_yaml::Value>,
) -> Result<String, ReconcilerError> {
    serde_yaml::to_string(settings).map_err(|e| ReconcilerError::internal("render yaml", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EnvVarSource as SpecEnvVarSource, KeySelector};

    #[test]
    fn test_yaml_scalar_keeps_types() {
        assert_eq!(yaml_scalar("true"), serde_yaml::Value::Bool(true));
        assert_eq!(yaml_scalar("42"), serde_yaml::Value::Number(42.into()));
        assert_eq!(
            yaml_scalar("/kibana"),
            serde_yaml::Value::String("/kibana".to_string())
        );
        // Structured values stay verbatim
        assert_eq!(
            yaml_scalar("[a, b]"),
            serde_yaml::Value::String("[a, b]".to_string())
        );
    }

    #[test]
    fn test_container_env_rejects_managed_names() {
        let settings = PodSettings {
            env: vec![EnvVar {
                name: "ELASTICSEARCH_HOSTS".to_string(),
                value: Some("x".to_string()),
                value_from: None,
            }],
            ..Default::default()
        };
        let err = container_env(vec![plain_env("ELASTICSEARCH_HOSTS", "y")], &settings).unwrap_err();
        assert_eq!(err.reason(), "InvalidSpec");
    }

    #[test]
    fn test_container_env_maps_user_references() {
        let settings = PodSettings {
            env: vec![EnvVar {
                name: "TOKEN".to_string(),
                value: None,
                value_from: Some(SpecEnvVarSource {
                    secret_key_ref: Some(KeySelector {
                        name: "tokens".to_string(),
                        key: "api".to_string(),
                    }),
                    config_map_key_ref: None,
                }),
            }],
            ..Default::default()
        };
        let env = container_env(Vec::new(), &settings).unwrap();
        let selector = env[0]
            .value_from
            .as_ref()
            .and_then(|source| source.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!((selector.name.as_str(), selector.key.as_str()), ("tokens", "api"));
    }
}
