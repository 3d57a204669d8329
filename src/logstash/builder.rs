//! # Logstash Builders
//!
//! Pure mappings from a `Logstash` spec, plus its pipeline contributions,
//! to child manifests.

use crate::builder::{
    container_env, container_env_from, node_selector, plain_env, pod_disruption_budget,
    pod_labels, pod_selector, render_yaml, resources, secret_env, yaml_scalar,
};
use crate::constants::LOGSTASH_API_PORT;
use crate::controller::managed::{child_meta, child_name, ownership_labels};
use crate::controller::ReconcilerError;
use crate::crd::{Logstash, LogstashPipeline};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet};

pub const CONFIG_SUFFIX: &str = "ls-config";
pub const PIPELINE_SUFFIX: &str = "ls-pipeline";
pub const CREDENTIALS_SUFFIX: &str = "ls-credentials";
pub const HEADLESS_SUFFIX: &str = "ls-headless";
pub const API_SUFFIX: &str = "ls";

const SETTINGS_FILE: &str = "logstash.yml";
const PIPELINES_FILE: &str = "pipelines.yml";
const CONFIG_DIR: &str = "/usr/share/logstash/config";
const PIPELINE_DIR: &str = "/usr/share/logstash/pipeline";
const CA_DIR: &str = "/usr/share/logstash/config/certs";

/// One entry of `pipelines.yml`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pipeline<'a> {
    id: String,
    config: &'a str,
    workers: Option<i32>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Inline pipelines first, then contributions sorted by id
fn pipelines<'a>(
    ls: &'a Logstash,
    contributions: &'a [LogstashPipeline],
) -> Result<Vec<Pipeline<'a>>, ReconcilerError> {
    let mut pipelines: Vec<Pipeline<'a>> = ls
        .spec
        .pipelines
        .iter()
        .map(|p| Pipeline {
            id: p.id.clone(),
            config: &p.config,
            workers: p.workers,
        })
        .collect();
    let mut contributed: Vec<Pipeline<'a>> = contributions
        .iter()
        .map(|p| Pipeline {
            id: p.pipeline_id(),
            config: &p.spec.pipeline,
            workers: p.spec.workers,
        })
        .collect();
    contributed.sort_by(|a, b| a.id.cmp(&b.id));
    pipelines.extend(contributed);

    let mut seen = BTreeSet::new();
    for pipeline in &pipelines {
        if !valid_id(&pipeline.id) {
            return Err(ReconcilerError::InvalidSpec(format!(
                "pipeline id {:?} must match [A-Za-z0-9._-]+",
                pipeline.id
            )));
        }
        if !seen.insert(pipeline.id.as_str()) {
            return Err(ReconcilerError::InvalidSpec(format!(
                "pipeline id {} is defined twice",
                pipeline.id
            )));
        }
    }
    Ok(pipelines)
}

fn settings(ls: &Logstash) -> Result<String, ReconcilerError> {
    let mut settings: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    settings.insert(
        "api.http.host".to_string(),
        serde_yaml::Value::String("0.0.0.0".to_string()),
    );
    settings.insert(
        "api.http.port".to_string(),
        serde_yaml::Value::Number(LOGSTASH_API_PORT.into()),
    );
    for (key, value) in &ls.spec.config {
        settings.insert(key.clone(), yaml_scalar(value));
    }
    render_yaml(&settings)
}

fn pipelines_yml(pipelines: &[Pipeline<'_>]) -> Result<String, ReconcilerError> {
    let entries: Vec<BTreeMap<&str, serde_yaml::Value>> = pipelines
        .iter()
        .map(|pipeline| {
            let mut entry = BTreeMap::from([
                ("pipeline.id", serde_yaml::Value::String(pipeline.id.clone())),
                (
                    "path.config",
                    serde_yaml::Value::String(format!("{PIPELINE_DIR}/{}.conf", pipeline.id)),
                ),
            ]);
            if let Some(workers) = pipeline.workers {
                entry.insert("pipeline.workers", serde_yaml::Value::Number(workers.into()));
            }
            entry
        })
        .collect();
    serde_yaml::to_string(&entries).map_err(|e| ReconcilerError::internal("render pipelines", e))
}

/// `<name>-ls-config` (settings and pipeline list) and `<name>-ls-pipeline` (definitions)
pub fn config_maps(
    ls: &Logstash,
    contributions: &[LogstashPipeline],
) -> Result<Vec<ConfigMap>, ReconcilerError> {
    let pipelines = pipelines(ls, contributions)?;
    let config = ConfigMap {
        metadata: child_meta(ls, child_name(ls, CONFIG_SUFFIX)),
        data: Some(BTreeMap::from([
            (SETTINGS_FILE.to_string(), settings(ls)?),
            (PIPELINES_FILE.to_string(), pipelines_yml(&pipelines)?),
        ])),
        ..Default::default()
    };
    let definitions = ConfigMap {
        metadata: child_meta(ls, child_name(ls, PIPELINE_SUFFIX)),
        data: Some(
            pipelines
                .iter()
                .map(|p| (format!("{}.conf", p.id), p.config.to_string()))
                .collect(),
        ),
        ..Default::default()
    };
    Ok(vec![config, definitions])
}

/// Copy of the Elasticsearch credentials Secret owned by the Logstash
pub fn credentials_secret(ls: &Logstash, source: &Secret) -> Secret {
    let mut data: BTreeMap<String, ByteString> = source.data.clone().unwrap_or_default();
    for (key, value) in source.string_data.iter().flatten() {
        data.insert(key.clone(), ByteString(value.clone().into_bytes()));
    }
    Secret {
        metadata: child_meta(ls, child_name(ls, CREDENTIALS_SUFFIX)),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn api_port() -> ServicePort {
    ServicePort {
        name: Some("api".to_string()),
        port: LOGSTASH_API_PORT,
        target_port: Some(IntOrString::Int(LOGSTASH_API_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Headless Service for the StatefulSet, and a ClusterIP Service for the API
pub fn services(ls: &Logstash) -> Result<Vec<Service>, ReconcilerError> {
    let headless = Service {
        metadata: child_meta(ls, child_name(ls, HEADLESS_SUFFIX)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(ownership_labels(ls)),
            ports: Some(vec![api_port()]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    let api = Service {
        metadata: child_meta(ls, child_name(ls, API_SUFFIX)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(ownership_labels(ls)),
            ports: Some(vec![api_port()]),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(vec![headless, api])
}

fn sub_path_mount(file: &str) -> VolumeMount {
    VolumeMount {
        name: "config".to_string(),
        mount_path: format!("{CONFIG_DIR}/{file}"),
        sub_path: Some(file.to_string()),
        read_only: Some(true),
        ..Default::default()
    }
}

fn volumes(ls: &Logstash) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: child_name(ls, CONFIG_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "pipeline".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: child_name(ls, PIPELINE_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        sub_path_mount(SETTINGS_FILE),
        sub_path_mount(PIPELINES_FILE),
        VolumeMount {
            name: "pipeline".to_string(),
            mount_path: PIPELINE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    if let Some(ca) = ls
        .spec
        .elasticsearch_ref
        .as_ref()
        .and_then(|es| es.ca_secret.as_deref())
    {
        volumes.push(Volume {
            name: "elasticsearch-certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ca.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "elasticsearch-certs".to_string(),
            mount_path: CA_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    (volumes, mounts)
}

/// The Logstash StatefulSet; checksums are added by the workload step
pub fn stateful_set(ls: &Logstash) -> Result<StatefulSet, ReconcilerError> {
    let mut managed_env = Vec::new();
    if let Some(es) = &ls.spec.elasticsearch_ref {
        if !es.hosts.is_empty() {
            managed_env.push(plain_env("ELASTICSEARCH_HOSTS", es.hosts.join(",")));
        }
        if es.credentials_secret.is_some() {
            let credentials = child_name(ls, CREDENTIALS_SUFFIX);
            managed_env.push(secret_env("ELASTICSEARCH_USERNAME", &credentials, "username"));
            managed_env.push(secret_env("ELASTICSEARCH_PASSWORD", &credentials, "password"));
        }
    }

    let (volumes, volume_mounts) = volumes(ls);
    let container = Container {
        name: "logstash".to_string(),
        image: Some(ls.spec.image()),
        ports: Some(vec![ContainerPort {
            name: Some("api".to_string()),
            container_port: LOGSTASH_API_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(container_env(managed_env, &ls.spec.pod)?),
        env_from: container_env_from(&ls.spec.pod),
        resources: resources(ls.spec.pod.resources.as_ref()),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(LOGSTASH_API_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: child_meta(ls, child_name(ls, API_SUFFIX)),
        spec: Some(StatefulSetSpec {
            replicas: Some(ls.spec.replicas),
            service_name: Some(child_name(ls, HEADLESS_SUFFIX)),
            pod_management_policy: Some("Parallel".to_string()),
            selector: pod_selector(ls),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(ls)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    node_selector: node_selector(&ls.spec.pod),
                    service_account_name: ls.spec.pod.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn disruption_budget(ls: &Logstash) -> Result<Vec<PodDisruptionBudget>, ReconcilerError> {
    pod_disruption_budget(
        ls,
        API_SUFFIX,
        ls.spec.pod_disruption_budget.as_ref(),
        ls.spec.replicas,
    )
}
