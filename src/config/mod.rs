//! # Configuration
//!
//! Operator configuration loaded once at startup from the environment.

mod controller;

pub use controller::ControllerConfig;

/// Configuration shared between controllers, the HTTP server and the drivers
pub type SharedControllerConfig = std::sync::Arc<ControllerConfig>;
