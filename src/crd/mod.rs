//! # Custom Resource Definitions
//!
//! CRD types served by the operator.
//!
//! ## Module Structure
//!
//! - `kibana.rs` - `Kibana` spec
//! - `logstash.rs` - `Logstash` spec and inline pipelines
//! - `pipeline.rs` - `LogstashPipeline`, a cross-namespace pipeline contribution
//! - `common.rs` - spec fragments shared by both clusters
//! - `status.rs` - status, phase and condition types

mod common;
mod kibana;
mod logstash;
mod pipeline;
mod status;

pub use common::{
    ElasticsearchRef, EndpointSpec, EnvFromSource, EnvVar, EnvVarSource, IngressSpec,
    KeySelector, LoadBalancerSpec, NameRef, PdbSpec, PodSettings, Resources,
};
pub use kibana::{Kibana, KibanaSpec};
pub use logstash::{Logstash, LogstashSpec, PipelineSpec};
pub use pipeline::{LogstashPipeline, LogstashPipelineSpec, LogstashRef};
pub use status::{
    ClusterStatus, Condition, ConditionStatus, Phase, INITIALIZING_REASON, READY_CONDITION,
};
