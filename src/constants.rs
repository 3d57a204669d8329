//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of every custom resource served by the operator
pub const API_GROUP: &str = "stack.octopilot.io";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "stack-operator";

/// Label carrying the name of the parent cluster on every child object
pub const CLUSTER_LABEL: &str = "stack.octopilot.io/cluster";

/// Label carrying the parent kind (`kibana`, `logstash`) on every child object
pub const COMPONENT_LABEL: &str = "stack.octopilot.io/component";

/// Standard managed-by label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Annotation holding the sha256 of the last manifest this operator applied
pub const APPLIED_HASH_ANNOTATION: &str = "stack.octopilot.io/applied-hash";

/// Prefix of the pod template annotations carrying referenced-data checksums
pub const CHECKSUM_ANNOTATION_PREFIX: &str = "checksum.stack.octopilot.io/";

/// Finalizer placed on `Kibana` resources
pub const KIBANA_FINALIZER: &str = "kibana.stack.octopilot.io/finalizer";

/// Finalizer placed on `Logstash` resources
pub const LOGSTASH_FINALIZER: &str = "logstash.stack.octopilot.io/finalizer";

/// Finalizer a `Logstash` places on every `LogstashPipeline` referencing it
pub const PIPELINE_FINALIZER: &str = "logstash.stack.octopilot.io/pipeline";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default maximum number of concurrent reconciliations per kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Requeue delay while a referenced object does not exist yet (seconds)
pub const DEFAULT_DEPENDENCY_POLL_SECS: u64 = 30;

/// Requeue delay while the workload is rolling out (seconds)
pub const DEFAULT_READINESS_POLL_SECS: u64 = 15;

/// Error backoff lower bound (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;

/// Error backoff upper bound (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Default delay before restarting a controller stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Kibana HTTP port
pub const KIBANA_PORT: i32 = 5601;

/// Logstash monitoring API port
pub const LOGSTASH_API_PORT: i32 = 9600;
