//! # Context
//!
//! Collaborators handed to every step, probe and tracker of a driver.

use crate::config::ControllerConfig;
use crate::controller::store::ObjectStore;
use crate::observability::Metrics;
use std::sync::Arc;

/// Store, metrics and configuration shared by one driver
#[derive(Debug)]
pub struct Context<S> {
    pub store: Arc<S>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<ControllerConfig>,
}

impl<S> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: ObjectStore> Context<S> {
    pub fn new(store: Arc<S>, metrics: Arc<Metrics>, config: Arc<ControllerConfig>) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }
}
