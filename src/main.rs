//! # stack-operator
//!
//! Kubernetes operator reconciling `Kibana` and `Logstash` clusters.
//!
//! Settings come from the environment (see `ControllerConfig::from_env`);
//! command line flags override them.

use anyhow::Result;
use clap::Parser;
use stack_operator::config::ControllerConfig;

#[derive(Debug, Parser)]
#[command(name = "stack-operator", version, about = "Kibana and Logstash operator", long_about = None)]
struct Args {
    /// Port serving /metrics, /healthz and /readyz
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Only watch resources in this namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Log output format
    #[arg(long, value_parser = ["json", "text"])]
    log_format: Option<String>,

    /// Maximum concurrent reconciliations per kind
    #[arg(long)]
    concurrency: Option<u16>,
}

impl Args {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(namespace) = self.namespace.filter(|ns| !ns.is_empty()) {
            config.watch_namespace = Some(namespace);
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent_reconciliations = concurrency;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().apply(ControllerConfig::from_env());
    stack_operator::runtime::run(config).await
}
