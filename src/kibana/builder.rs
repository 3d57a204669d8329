//! # Kibana Builders
//!
//! Pure mappings from a `Kibana` spec to its child manifests.

use crate::builder::{
    container_env, container_env_from, node_selector, plain_env, pod_disruption_budget,
    pod_labels, pod_selector, render_yaml, resources, secret_env, yaml_scalar,
};
use crate::constants::KIBANA_PORT;
use crate::controller::managed::{child_meta, child_name, ownership_labels, Managed};
use crate::controller::ReconcilerError;
use crate::crd::{IngressSpec, Kibana};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Secret,
    Probe, SecretVolumeSource, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume,
    VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec as KubeIngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::BTreeMap;

pub const CONFIG_SUFFIX: &str = "kb-config";
pub const CREDENTIALS_SUFFIX: &str = "kb-credentials";
pub const HTTP_SUFFIX: &str = "kb";

const CONFIG_FILE: &str = "kibana.yml";
const CONFIG_DIR: &str = "/usr/share/kibana/config";
const CA_DIR: &str = "/usr/share/kibana/config/elasticsearch-certs";
const KEYSTORE_DIR: &str = "/usr/share/kibana/config/keystore";

/// Generated encryption keys: (secret key, env variable, kibana.yml setting)
pub const ENCRYPTION_KEYS: [(&str, &str, &str); 3] = [
    (
        "security-encryption-key",
        "KIBANA_SECURITY_ENCRYPTION_KEY",
        "xpack.security.encryptionKey",
    ),
    (
        "saved-objects-encryption-key",
        "KIBANA_SAVED_OBJECTS_ENCRYPTION_KEY",
        "xpack.encryptedSavedObjects.encryptionKey",
    ),
    (
        "reporting-encryption-key",
        "KIBANA_REPORTING_ENCRYPTION_KEY",
        "xpack.reporting.encryptionKey",
    ),
];

fn ingress(kb: &Kibana) -> Option<&IngressSpec> {
    IngressSpec::is_enabled(kb.spec.endpoint.ingress.as_ref())
}

fn load_balancer(kb: &Kibana) -> bool {
    kb.spec
        .endpoint
        .load_balancer
        .as_ref()
        .is_some_and(|lb| lb.enabled)
}

/// `kibana.yml`: operator defaults, overridden by `spec.config`
pub fn config_map(kb: &Kibana) -> Result<Vec<ConfigMap>, ReconcilerError> {
    let mut settings: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    let setting = |value: &str| serde_yaml::Value::String(value.to_string());

    settings.insert(
        "server.name".to_string(),
        setting(kb.meta().name.as_deref().unwrap_or_default()),
    );
    settings.insert("server.host".to_string(), setting("0.0.0.0"));
    if let Some(url) = kb.url() {
        settings.insert("server.publicBaseUrl".to_string(), setting(&url));
    }
    for (_, env, key) in ENCRYPTION_KEYS {
        settings.insert(key.to_string(), setting(&format!("${{{env}}}")));
    }
    if let Some(es) = &kb.spec.elasticsearch_ref {
        if !es.hosts.is_empty() {
            settings.insert(
                "elasticsearch.hosts".to_string(),
                serde_yaml::Value::Sequence(es.hosts.iter().map(|h| setting(h)).collect()),
            );
        }
        if es.credentials_secret.is_some() {
            settings.insert(
                "elasticsearch.username".to_string(),
                setting("${ELASTICSEARCH_USERNAME}"),
            );
            settings.insert(
                "elasticsearch.password".to_string(),
                setting("${ELASTICSEARCH_PASSWORD}"),
            );
        }
        if es.ca_secret.is_some() {
            settings.insert(
                "elasticsearch.ssl.certificateAuthorities".to_string(),
                serde_yaml::Value::Sequence(vec![setting(&format!("{CA_DIR}/ca.crt"))]),
            );
        }
    }
    for (key, value) in &kb.spec.config {
        settings.insert(key.clone(), yaml_scalar(value));
    }

    Ok(vec![ConfigMap {
        metadata: child_meta(kb, child_name(kb, CONFIG_SUFFIX)),
        data: Some(BTreeMap::from([(
            CONFIG_FILE.to_string(),
            render_yaml(&settings)?,
        )])),
        ..Default::default()
    }])
}

fn generate_key() -> ByteString {
    let key = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    ByteString(key.into_bytes())
}

/// Encryption keys, copied forward from `existing` so they survive every pass
pub fn credentials_secret(kb: &Kibana, existing: Option<&Secret>) -> Secret {
    let previous = existing.and_then(|secret| secret.data.as_ref());
    let data = ENCRYPTION_KEYS
        .iter()
        .map(|(key, _, _)| {
            let value = previous
                .and_then(|data| data.get(*key))
                .filter(|value| !value.0.is_empty())
                .cloned()
                .unwrap_or_else(generate_key);
            ((*key).to_string(), value)
        })
        .collect();
    Secret {
        metadata: child_meta(kb, child_name(kb, CREDENTIALS_SUFFIX)),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// ClusterIP Service, or LoadBalancer when enabled
pub fn service(kb: &Kibana) -> Result<Vec<Service>, ReconcilerError> {
    let mut metadata = child_meta(kb, child_name(kb, HTTP_SUFFIX));
    let service_type = if load_balancer(kb) {
        metadata.annotations = kb
            .spec
            .endpoint
            .load_balancer
            .as_ref()
            .filter(|lb| !lb.annotations.is_empty())
            .map(|lb| lb.annotations.clone());
        "LoadBalancer"
    } else {
        "ClusterIP"
    };
    Ok(vec![Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(ownership_labels(kb)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: KIBANA_PORT,
                target_port: Some(IntOrString::Int(KIBANA_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }])
}

fn volumes(kb: &Kibana) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: child_name(kb, CONFIG_SUFFIX),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "config".to_string(),
        mount_path: format!("{CONFIG_DIR}/{CONFIG_FILE}"),
        sub_path: Some(CONFIG_FILE.to_string()),
        read_only: Some(true),
        ..Default::default()
    }];

    let mut secret_volume = |name: &str, secret: &str, path: &str| {
        volumes.push(Volume {
            name: name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    };
    if let Some(ca) = kb
        .spec
        .elasticsearch_ref
        .as_ref()
        .and_then(|es| es.ca_secret.as_deref())
    {
        secret_volume("elasticsearch-certs", ca, CA_DIR);
    }
    if let Some(keystore) = kb.spec.keystore_secret.as_deref() {
        secret_volume("keystore", keystore, KEYSTORE_DIR);
    }
    (volumes, mounts)
}

/// The Kibana Deployment; checksums are added by the workload step
pub fn deployment(kb: &Kibana) -> Result<Deployment, ReconcilerError> {
    let credentials = child_name(kb, CREDENTIALS_SUFFIX);
    let mut managed_env: Vec<_> = ENCRYPTION_KEYS
        .iter()
        .map(|(key, env, _)| secret_env(env, &credentials, key))
        .collect();
    if let Some(secret) = kb
        .spec
        .elasticsearch_ref
        .as_ref()
        .and_then(|es| es.credentials_secret.as_deref())
    {
        managed_env.push(secret_env("ELASTICSEARCH_USERNAME", secret, "username"));
        managed_env.push(secret_env("ELASTICSEARCH_PASSWORD", secret, "password"));
    }
    managed_env.push(plain_env("NODE_OPTIONS", "--max-old-space-size=1024"));

    let (volumes, volume_mounts) = volumes(kb);
    let container = Container {
        name: "kibana".to_string(),
        image: Some(kb.spec.image()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: KIBANA_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(container_env(managed_env, &kb.spec.pod)?),
        env_from: container_env_from(&kb.spec.pod),
        resources: resources(kb.spec.pod.resources.as_ref()),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(KIBANA_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: child_meta(kb, child_name(kb, HTTP_SUFFIX)),
        spec: Some(DeploymentSpec {
            replicas: Some(kb.spec.replicas),
            selector: pod_selector(kb),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(kb)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    node_selector: node_selector(&kb.spec.pod),
                    service_account_name: kb.spec.pod.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Ingress routing `host` to the Kibana Service; none when disabled
pub fn ingress_route(kb: &Kibana) -> Result<Vec<Ingress>, ReconcilerError> {
    let Some(spec) = ingress(kb) else {
        return Ok(Vec::new());
    };
    let host = spec
        .host
        .as_deref()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| {
            ReconcilerError::InvalidSpec("endpoint.ingress.host is required".to_string())
        })?;

    let mut metadata = child_meta(kb, child_name(kb, HTTP_SUFFIX));
    if !spec.annotations.is_empty() {
        metadata.annotations = Some(spec.annotations.clone());
    }
    Ok(vec![Ingress {
        metadata,
        spec: Some(KubeIngressSpec {
            ingress_class_name: spec.ingress_class_name.clone(),
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(spec.path.clone().unwrap_or_else(|| "/".to_string())),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: child_name(kb, HTTP_SUFFIX),
                                port: Some(ServiceBackendPort {
                                    number: Some(KIBANA_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: spec.tls_secret.as_ref().map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![host.to_string()]),
                    secret_name: Some(secret.clone()),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }])
}

pub fn disruption_budget(kb: &Kibana) -> Result<Vec<PodDisruptionBudget>, ReconcilerError> {
    pod_disruption_budget(
        kb,
        HTTP_SUFFIX,
        kb.spec.pod_disruption_budget.as_ref(),
        kb.spec.replicas,
    )
}
