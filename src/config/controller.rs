//! # Controller Configuration
//!
//! Operator-level settings loaded from environment variables.

use std::time::Duration;

/// Operator-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// How long to wait for the HTTP server to bind (seconds)
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the HTTP server (milliseconds)
    pub server_poll_interval_ms: u64,
    /// Maximum concurrent reconciliations per managed kind
    pub max_concurrent_reconciliations: u16,
    /// Requeue delay while a referenced object does not exist yet (seconds)
    pub dependency_poll_secs: u64,
    /// Requeue delay while the workload is not ready yet (seconds)
    pub readiness_poll_secs: u64,
    /// Error backoff lower bound (seconds)
    pub backoff_min_secs: u64,
    /// Error backoff upper bound (seconds)
    pub backoff_max_secs: u64,
    /// Delay before restarting a controller stream that ended (seconds)
    pub watch_restart_delay_secs: u64,
    /// Restrict every watch to one namespace; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            dependency_poll_secs: DEFAULT_DEPENDENCY_POLL_SECS,
            readiness_poll_secs: DEFAULT_READINESS_POLL_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_namespace: None,
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            server_startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            server_poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
            dependency_poll_secs: env_var_or_default(
                "DEPENDENCY_POLL_SECS",
                DEFAULT_DEPENDENCY_POLL_SECS,
            ),
            readiness_poll_secs: env_var_or_default(
                "READINESS_POLL_SECS",
                DEFAULT_READINESS_POLL_SECS,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", DEFAULT_BACKOFF_MIN_SECS),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Get the dependency poll duration
    pub fn dependency_poll(&self) -> Duration {
        Duration::from_secs(self.dependency_poll_secs)
    }

    /// Get the readiness poll duration
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs)
    }

    /// Get backoff lower bound
    pub fn backoff_min(&self) -> Duration {
        Duration::from_secs(self.backoff_min_secs)
    }

    /// Get backoff upper bound
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_durations() {
        let config = ControllerConfig::default();
        assert_eq!(config.dependency_poll(), Duration::from_secs(30));
        assert_eq!(config.readiness_poll(), Duration::from_secs(15));
        assert!(config.backoff_min() < config.backoff_max());
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        // Unset and unparsable values both yield the default
        assert_eq!(
            env_var_or_default("STACK_OPERATOR_TEST_UNSET_VALUE", 42_u64),
            42
        );
    }
}
