//! Stack Operator Library
//!
//! Reconcile engine and resource modules of the Kibana and Logstash operator.
//!
//! - `controller`: the generic engine (driver, steps, store, indexes, finalizers)
//! - `kibana`, `logstash`: the step pipeline and builders per managed kind
//! - `crd`: custom resource types
//! - `runtime`, `server`: process wiring for the operator binary

pub mod builder;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod kibana;
pub mod logstash;
pub mod observability;
pub mod runtime;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::ControllerConfig;
    use crate::controller::{Context, MemoryStore};
    use crate::observability::Metrics;
    use std::sync::Arc;

    pub fn context() -> Context<MemoryStore> {
        Context::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Metrics::new().unwrap()),
            Arc::new(ControllerConfig::default()),
        )
    }
}
