//! # Diff
//!
//! Classifies children into create, update and delete sets by name.
//!
//! An expected child is stamped with the sha256 of its canonical manifest
//! (`stack.octopilot.io/applied-hash`). A live child needs an update when
//! that hash differs or when the expected manifest is no longer a structural
//! subset of the live object (someone edited a field we manage). Fields
//! defaulted or added by the server or other managers never cause an update.

use crate::constants::APPLIED_HASH_ANNOTATION;
use crate::controller::error::ReconcilerError;
use crate::controller::store::{is_deleting, Object};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata fields assigned by the server
const VOLATILE_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Outcome of comparing live children with expected ones
#[derive(Debug, Clone)]
pub struct Plan<K> {
    pub create: Vec<K>,
    pub update: Vec<K>,
    pub delete: Vec<K>,
}

impl<K> Plan<K> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

impl<K> Default for Plan<K> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// Strip server-assigned fields and status in place
pub fn normalize(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    object.remove("status");
    if let Some(Value::Object(meta)) = object.get_mut("metadata") {
        for field in VOLATILE_METADATA {
            meta.remove(*field);
        }
    }
}

/// Serialize with keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(key, value)| format!("{}:{}", Value::String(key.clone()), canonical_json(value)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Hex sha256 of the canonical, normalized manifest without the hash annotation
pub fn manifest_hash<K: Object>(obj: &K) -> Result<String, ReconcilerError> {
    let mut value =
        serde_json::to_value(obj).map_err(|e| ReconcilerError::internal("encode manifest", e))?;
    normalize(&mut value);
    if let Some(Value::Object(annotations)) = value.pointer_mut("/metadata/annotations") {
        annotations.remove(APPLIED_HASH_ANNOTATION);
    }
    Ok(hex_sha256(canonical_json(&value).as_bytes()))
}

pub(crate) fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Resource quantity maps; the server stores their values in canonical form
const QUANTITY_MAPS: &[&str] = &["requests", "limits"];

/// Multiplier of a quantity suffix
fn quantity_scale(suffix: &str) -> Option<f64> {
    let scale = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => return None,
    };
    Some(scale)
}

/// Numeric value of a Kubernetes quantity such as `500m`, `1.5Gi` or `1e3`
pub(crate) fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    if number.is_empty() {
        return None;
    }
    let number: f64 = number.parse().ok()?;
    if let Some(scale) = quantity_scale(suffix) {
        return Some(number * scale);
    }
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    Some(number * 10f64.powi(exponent.parse().ok()?))
}

fn same_quantity(expected: &Value, current: &Value) -> bool {
    let (Some(expected), Some(current)) = (expected.as_str(), current.as_str()) else {
        return expected == current;
    };
    match (parse_quantity(expected), parse_quantity(current)) {
        (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()),
        _ => expected == current,
    }
}

/// Whether every field set in `expected` holds the same value in `current`
///
/// Objects compare key by key; arrays must have the same length and compare
/// element-wise; `null` in `expected` is ignored and an empty expected value
/// matches a missing one. Values under `requests` and `limits` compare as
/// quantities, so `1000m` matches the `1` the server stores.
pub fn is_subset(expected: &Value, current: &Value) -> bool {
    subset(expected, current, false)
}

fn subset(expected: &Value, current: &Value, quantities: bool) -> bool {
    match (expected, current) {
        (Value::Object(expected), Value::Object(current)) => {
            expected.iter().all(|(key, value)| match current.get(key) {
                _ if value.is_null() => true,
                Some(live) if quantities => same_quantity(value, live),
                Some(live) => subset(value, live, QUANTITY_MAPS.contains(&key.as_str())),
                None => is_empty(value),
            })
        }
        (Value::Array(expected), Value::Array(current)) => {
            expected.len() == current.len()
                && expected.iter().zip(current).all(|(e, c)| subset(e, c, false))
        }
        (expected, Value::Null) => is_empty(expected),
        (expected, current) => expected == current,
    }
}

fn name_of<K: Object>(obj: &K) -> Result<String, ReconcilerError> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| ReconcilerError::Internal(format!("{} without a name", K::kind(&()))))
}

/// Write the applied-hash annotation onto `obj`
pub fn stamp<K: Object>(obj: &mut K) -> Result<String, ReconcilerError> {
    let hash = manifest_hash(obj)?;
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(APPLIED_HASH_ANNOTATION.to_string(), hash.clone());
    Ok(hash)
}

fn needs_update<K: Object>(expected: &K, current: &K, hash: &str) -> Result<bool, ReconcilerError> {
    let applied = current
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(APPLIED_HASH_ANNOTATION));
    if applied.map(String::as_str) != Some(hash) {
        return Ok(true);
    }
    let mut expected =
        serde_json::to_value(expected).map_err(|e| ReconcilerError::internal("encode expected", e))?;
    let mut current =
        serde_json::to_value(current).map_err(|e| ReconcilerError::internal("encode current", e))?;
    normalize(&mut expected);
    normalize(&mut current);
    Ok(!is_subset(&expected, &current))
}

/// Compare live children with expected ones by name
///
/// Expected children come back stamped with their applied hash. Live
/// children already being deleted are not deleted again.
pub fn diff<K: Object>(current: Vec<K>, expected: Vec<K>) -> Result<Plan<K>, ReconcilerError> {
    let mut live: BTreeMap<String, K> = BTreeMap::new();
    for obj in current {
        live.insert(name_of(&obj)?, obj);
    }

    let mut seen = BTreeSet::new();
    let mut plan = Plan::default();
    for mut obj in expected {
        let name = name_of(&obj)?;
        if !seen.insert(name.clone()) {
            return Err(ReconcilerError::Internal(format!(
                "{} {name} expected twice",
                K::kind(&())
            )));
        }
        let hash = stamp(&mut obj)?;
        match live.remove(&name) {
            None => plan.create.push(obj),
            Some(existing) => {
                if needs_update(&obj, &existing, &hash)? {
                    plan.update.push(obj);
                }
            }
        }
    }

    plan.delete = live.into_values().filter(|obj| !is_deleting(obj)).collect();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some([("key".to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    /// What the server hands back after applying `obj`
    fn live(obj: &ConfigMap) -> ConfigMap {
        let mut live = obj.clone();
        stamp(&mut live).unwrap();
        live.metadata.uid = Some("uid-1".to_string());
        live.metadata.resource_version = Some("7".to_string());
        live.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("added-by".to_string(), "someone-else".to_string());
        live
    }

    #[test]
    fn test_classifies_by_name() {
        let current = vec![live(&config_map("keep", "1")), live(&config_map("orphan", "1"))];
        let expected = vec![config_map("keep", "1"), config_map("new", "1")];

        let plan = diff(current, expected).unwrap();
        assert_eq!(plan.create.len(), 1);
        assert!(plan.update.is_empty());
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].metadata.name.as_deref(), Some("orphan"));
    }

    #[test]
    fn test_changed_content_is_an_update() {
        let plan = diff(vec![live(&config_map("a", "1"))], vec![config_map("a", "2")]).unwrap();
        assert_eq!(plan.update.len(), 1);
        assert!(plan.create.is_empty() && plan.delete.is_empty());
    }

    #[test]
    fn test_drift_on_managed_field_is_an_update() {
        let mut drifted = live(&config_map("a", "1"));
        drifted.data = Some([("key".to_string(), "edited".to_string())].into());
        let plan = diff(vec![drifted], vec![config_map("a", "1")]).unwrap();
        assert_eq!(plan.update.len(), 1);
    }

    #[test]
    fn test_duplicate_expected_names_fail() {
        let result = diff(Vec::new(), vec![config_map("a", "1"), config_map("a", "2")]);
        assert!(matches!(result, Err(ReconcilerError::Internal(_))));
    }

    #[test]
    fn test_deleting_orphans_are_left_alone() {
        let mut orphan = live(&config_map("orphan", "1"));
        orphan.metadata.deletion_timestamp =
            serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
        let plan = diff(vec![orphan], Vec::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_hash_ignores_volatile_fields_and_key_order() {
        let mut a = config_map("a", "1");
        let mut b = config_map("a", "1");
        b.metadata.resource_version = Some("99".to_string());
        a.metadata.labels = Some([("x".to_string(), "1".to_string()), ("y".to_string(), "2".to_string())].into());
        b.metadata.labels = Some([("y".to_string(), "2".to_string()), ("x".to_string(), "1".to_string())].into());
        assert_eq!(manifest_hash(&a).unwrap(), manifest_hash(&b).unwrap());
    }

    #[test]
    fn test_subset_rules() {
        assert!(is_subset(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!is_subset(&json!({"a": 1}), &json!({"a": 2})));
        assert!(is_subset(&json!({"a": null}), &json!({})));
        assert!(is_subset(&json!({"a": []}), &json!({})));
        assert!(is_subset(&json!({"a": ""}), &json!({})));
        assert!(!is_subset(&json!({"a": [1]}), &json!({"a": [1, 2]})));
        assert!(is_subset(
            &json!({"a": [{"name": "x"}]}),
            &json!({"a": [{"name": "x", "protocol": "TCP"}]})
        ));
    }

    #[test]
    fn test_parse_quantity_suffixes() {
        assert_eq!(parse_quantity("1000m"), Some(1.0));
        assert_eq!(parse_quantity("2Gi"), Some(2.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("1Ei"), Some(1024.0_f64.powi(6)));
        assert_eq!(parse_quantity("1.5k"), Some(1500.0));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("12parsecs"), None);
    }

    #[test]
    fn test_canonicalized_quantities_are_not_drift() {
        let expected = json!({"spec": {"containers": [{
            "name": "kibana",
            "resources": {"limits": {"cpu": "1000m", "memory": "1024Mi"}, "requests": {"cpu": "0.5"}}
        }]}});
        let stored = json!({"spec": {"containers": [{
            "name": "kibana",
            "resources": {"limits": {"cpu": "1", "memory": "1Gi"}, "requests": {"cpu": "500m"}}
        }]}});
        assert!(is_subset(&expected, &stored));

        let raised = json!({"spec": {"containers": [{
            "name": "kibana",
            "resources": {"limits": {"cpu": "2", "memory": "1Gi"}, "requests": {"cpu": "500m"}}
        }]}});
        assert!(!is_subset(&expected, &raised));
        // Outside resource maps strings compare verbatim
        assert!(!is_subset(&json!({"data": {"cpu": "1000m"}}), &json!({"data": {"cpu": "1"}})));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        assert_eq!(
            canonical_json(&json!({"b": {"d": 1, "c": [2, {"f": 3, "e": 4}]}, "a": "x"})),
            r#"{"a":"x","b":{"c":[2,{"e":4,"f":3}],"d":1}}"#
        );
    }
}
