//! # Initialization
//!
//! Operator startup: rustls setup, tracing, metrics, server startup and
//! Kubernetes client setup.

use crate::config::{ControllerConfig, SharedControllerConfig};
use crate::observability::Metrics;
use crate::server::{start_server, ServerState};
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const DEFAULT_LOG_FILTER: &str = "stack_operator=info";

/// Everything the watch loop needs once startup succeeded
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Server state for health checks and metrics
    pub server_state: Arc<ServerState>,
    /// Shared metrics registry, also held by `server_state`
    pub metrics: Arc<Metrics>,
    pub controller_config: SharedControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready())
            .field("controller_config", &self.controller_config)
            .finish_non_exhaustive()
    }
}

/// Initialize the operator runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
pub async fn initialize(config: ControllerConfig) -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    init_tracing(&config.log_format)?;

    info!("Starting stack-operator");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
    let server_state = Arc::new(ServerState::new(Arc::clone(&metrics)));
    let controller_config: SharedControllerConfig = Arc::new(config);

    // Start server in background task; it marks itself ready once bound
    let server_port = controller_config.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_server_ready(
        &server_state,
        &server_handle,
        Duration::from_secs(controller_config.server_startup_timeout_secs),
        Duration::from_millis(controller_config.server_poll_interval_ms),
    )
    .await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    match &controller_config.watch_namespace {
        Some(namespace) => info!(namespace = namespace.as_str(), "Watching one namespace"),
        None => info!("Watching all namespaces"),
    }
    info!("Operator initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        server_state,
        metrics,
        controller_config,
    })
}

fn init_tracing(log_format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if log_format.eq_ignore_ascii_case("text") {
        builder.try_init()
    } else {
        builder.json().try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    startup_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_fails_when_server_task_exits() {
        let state = Arc::new(ServerState::new(Arc::new(Metrics::new().unwrap())));
        let handle = tokio::spawn(async {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = wait_for_server_ready(
            &state,
            &handle,
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let state = Arc::new(ServerState::new(Arc::new(Metrics::new().unwrap())));
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = wait_for_server_ready(
            &state,
            &handle,
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("within"));
        handle.abort();
    }
}
