//! # Cluster Status
//!
//! Status shared by `Kibana` and `Logstash`: a phase, an ordered condition
//! list keyed by type, and the observed generation.

use serde::{Deserialize, Serialize};

/// Aggregated readiness condition maintained by the driver
pub const READY_CONDITION: &str = "Ready";

/// Reason used when a condition is seeded on first sight
pub const INITIALIZING_REASON: &str = "Initializing";

/// Lifecycle phase of a managed cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum Phase {
    /// Children are being created or the workload is rolling out
    #[default]
    Starting,
    /// Every step converged and the workload is ready
    Running,
    /// The last pass failed
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            Phase::Starting => "Starting",
            Phase::Running => "Running",
            Phase::Error => "Error",
        };
        f.write_str(phase)
    }
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition represents one typed observation about the resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, unique within the list
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,
    /// Machine-readable reason in CamelCase
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Generation of the resource this condition was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last time `status` changed (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

/// Status of a `Kibana` or `Logstash` resource
///
/// Optional fields serialize as `null` so a merge patch clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase of reconciliation
    #[serde(default)]
    pub phase: Phase,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Highest generation fully reconciled
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Whether the last pass ended in an error
    #[serde(default)]
    pub is_on_error: bool,
    /// Externally reachable URL, when an endpoint is exposed
    #[serde(default)]
    pub url: Option<String>,
}

impl ClusterStatus {
    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|condition| condition.r#type == condition_type)
    }

    /// Replace the condition of the same type in place, or append it
    ///
    /// `last_transition_time` is carried over unless the status flips.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|existing| existing.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                } else if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(now());
                }
                *existing = condition;
            }
            None => {
                if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(now());
                }
                self.conditions.push(condition);
            }
        }
    }

    /// Append an `Unknown` condition for every type not present yet
    pub fn seed_conditions(&mut self, types: &[&str], generation: Option<i64>) {
        for condition_type in types {
            if self.condition(condition_type).is_none() {
                self.set_condition(Condition::new(
                    condition_type,
                    ConditionStatus::Unknown,
                    INITIALIZING_REASON,
                    "",
                    generation,
                ));
            }
        }
    }

    /// Whether the aggregated `Ready` condition is `True`
    pub fn is_ready(&self) -> bool {
        self.condition(READY_CONDITION)
            .is_some_and(|condition| condition.status == ConditionStatus::True)
    }
}

impl Condition {
    /// Build a condition without a transition time; `set_condition` fills it in
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
            last_transition_time: None,
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
