//! # Checksum Annotator
//!
//! Forces a rollout when the content of a mounted or injected ConfigMap or
//! Secret changes. Each referenced blob is hashed over its sorted key/value
//! data and the hash lands on the pod template as
//! `checksum.stack.octopilot.io/<kind>-<name>`.
//!
//! References are discovered from the built pod spec itself: ConfigMap and
//! Secret volumes plus every `env`/`envFrom` entry of every container.

use crate::constants::CHECKSUM_ANNOTATION_PREFIX;
use crate::controller::diff::{canonical_json, hex_sha256};
use crate::controller::error::StoreError;
use crate::controller::store::{ObjectKey, ObjectStore};
use base64::Engine as _;
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec, Secret};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum length of the name part of an annotation key
const MAX_ANNOTATION_NAME: usize = 63;

/// Kind of a referenced data blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlobKind {
    ConfigMap,
    Secret,
}

impl BlobKind {
    fn as_str(self) -> &'static str {
        match self {
            BlobKind::ConfigMap => "configmap",
            BlobKind::Secret => "secret",
        }
    }
}

/// A ConfigMap or Secret referenced by a pod, in the pod's namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobRef {
    pub kind: BlobKind,
    pub name: String,
}

impl BlobRef {
    pub fn config_map(name: impl Into<String>) -> Self {
        Self {
            kind: BlobKind::ConfigMap,
            name: name.into(),
        }
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            kind: BlobKind::Secret,
            name: name.into(),
        }
    }

    /// Pod template annotation key carrying this blob's checksum
    pub fn annotation_key(&self) -> String {
        let name = format!("{}-{}", self.kind.as_str(), self.name);
        if name.len() <= MAX_ANNOTATION_NAME {
            return format!("{CHECKSUM_ANNOTATION_PREFIX}{name}");
        }
        let suffix = &hex_sha256(name.as_bytes())[..8];
        let keep = MAX_ANNOTATION_NAME - suffix.len() - 1;
        let head = name[..keep].trim_end_matches(['-', '.']);
        format!("{CHECKSUM_ANNOTATION_PREFIX}{head}-{suffix}")
    }
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Content hash of a ConfigMap (`data` and `binaryData`, sorted by key)
pub fn config_map_hash(config_map: &ConfigMap) -> String {
    let data: BTreeMap<&String, &String> = config_map.data.iter().flatten().collect();
    let binary: BTreeMap<&String, String> = config_map
        .binary_data
        .iter()
        .flatten()
        .map(|(key, value)| (key, encode(&value.0)))
        .collect();
    hash(&json!({ "data": data, "binaryData": binary }))
}

/// Content hash of a Secret (`data` overlaid with `stringData`, sorted by key)
pub fn secret_hash(secret: &Secret) -> String {
    let mut data: BTreeMap<&String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key, encode(&value.0)))
        .collect();
    for (key, value) in secret.string_data.iter().flatten() {
        data.insert(key, encode(value.as_bytes()));
    }
    hash(&json!({ "data": data }))
}

fn hash(value: &Value) -> String {
    hex_sha256(canonical_json(value).as_bytes())
}

fn container_references(container: &Container, refs: &mut BTreeSet<BlobRef>) {
    for var in container.env.iter().flatten() {
        let Some(source) = &var.value_from else {
            continue;
        };
        if let Some(selector) = &source.secret_key_ref {
            refs.insert(BlobRef::secret(&selector.name));
        }
        if let Some(selector) = &source.config_map_key_ref {
            refs.insert(BlobRef::config_map(&selector.name));
        }
    }
    for source in container.env_from.iter().flatten() {
        if let Some(secret) = &source.secret_ref {
            refs.insert(BlobRef::secret(&secret.name));
        }
        if let Some(config_map) = &source.config_map_ref {
            refs.insert(BlobRef::config_map(&config_map.name));
        }
    }
}

/// Every ConfigMap and Secret a pod mounts or injects, sorted and deduplicated
pub fn pod_references(pod: &PodSpec) -> Vec<BlobRef> {
    let mut refs = BTreeSet::new();
    for volume in pod.volumes.iter().flatten() {
        if let Some(config_map) = &volume.config_map {
            refs.insert(BlobRef::config_map(&config_map.name));
        }
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.as_ref()) {
            refs.insert(BlobRef::secret(name));
        }
    }
    for container in pod.init_containers.iter().flatten().chain(&pod.containers) {
        container_references(container, &mut refs);
    }
    refs.into_iter().collect()
}

/// Hash every referenced blob in `namespace`
///
/// Returns `Ok(None)` as soon as one blob is missing: callers must wait
/// rather than roll out against a partial checksum set. The map is keyed by
/// annotation key.
pub async fn collect<S: ObjectStore>(
    store: &S,
    namespace: &str,
    refs: &[BlobRef],
) -> Result<Option<BTreeMap<String, String>>, StoreError> {
    let mut checksums = BTreeMap::new();
    for blob in refs {
        let key = ObjectKey::new(namespace, &blob.name);
        let hash = match blob.kind {
            BlobKind::ConfigMap => store.get::<ConfigMap>(&key).await?.map(|cm| config_map_hash(&cm)),
            BlobKind::Secret => store.get::<Secret>(&key).await?.map(|s| secret_hash(&s)),
        };
        let Some(hash) = hash else {
            return Ok(None);
        };
        checksums.insert(blob.annotation_key(), hash);
    }
    Ok(Some(checksums))
}

/// Blobs among `refs` that do not exist yet, for wait messages
pub async fn missing<S: ObjectStore>(
    store: &S,
    namespace: &str,
    refs: &[BlobRef],
) -> Result<Vec<String>, StoreError> {
    let mut missing = Vec::new();
    for blob in refs {
        let key = ObjectKey::new(namespace, &blob.name);
        let exists = match blob.kind {
            BlobKind::ConfigMap => store.get::<ConfigMap>(&key).await?.is_some(),
            BlobKind::Secret => store.get::<Secret>(&key).await?.is_some(),
        };
        if !exists {
            missing.push(format!("{}/{}", blob.kind.as_str(), blob.name));
        }
    }
    Ok(missing)
}

/// Write the checksums onto the pod template annotations
pub fn annotate(template: &mut PodTemplateSpec, checksums: BTreeMap<String, String>) {
    if checksums.is_empty() {
        return;
    }
    let metadata = template.metadata.get_or_insert_with(Default::default);
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(checksums);
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapVolumeSource, EnvFromSource, EnvVar, EnvVarSource,
        SecretKeySelector, SecretVolumeSource, Volume,
    };
    use k8s_openapi::ByteString;

    fn config_map(pairs: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_map_hash_ignores_insertion_order() {
        let a = config_map(&[("a", "1"), ("b", "2")]);
        let b = config_map(&[("b", "2"), ("a", "1")]);
        assert_eq!(config_map_hash(&a), config_map_hash(&b));
        assert_ne!(
            config_map_hash(&a),
            config_map_hash(&config_map(&[("a", "1"), ("b", "3")]))
        );
    }

    #[test]
    fn test_secret_hash_covers_string_data() {
        let from_data = Secret {
            data: Some([("k".to_string(), ByteString(b"v".to_vec()))].into()),
            ..Default::default()
        };
        let from_string_data = Secret {
            string_data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        };
        assert_eq!(secret_hash(&from_data), secret_hash(&from_string_data));
    }

    #[test]
    fn test_pod_references_scans_every_env_entry() {
        let secret_env = |name: &str| EnvVar {
            name: name.to_uppercase(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: name.to_string(),
                    key: "k".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pod = PodSpec {
            volumes: Some(vec![
                Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: "cfg".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "certs".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("ca".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            containers: vec![Container {
                name: "main".to_string(),
                env: Some(vec![secret_env("first"), secret_env("second")]),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: "extra".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            pod_references(&pod),
            vec![
                BlobRef::config_map("cfg"),
                BlobRef::config_map("extra"),
                BlobRef::secret("ca"),
                BlobRef::secret("first"),
                BlobRef::secret("second"),
            ]
        );
    }

    #[test]
    fn test_annotation_key_is_bounded() {
        let short = BlobRef::secret("creds");
        assert_eq!(
            short.annotation_key(),
            "checksum.stack.octopilot.io/secret-creds"
        );

        let long = BlobRef::config_map("x".repeat(80));
        let key = long.annotation_key();
        let name = key.trim_start_matches(CHECKSUM_ANNOTATION_PREFIX);
        assert!(name.len() <= MAX_ANNOTATION_NAME);
        assert_ne!(key, BlobRef::config_map("x".repeat(81)).annotation_key());
    }
}
