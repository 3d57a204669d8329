//! # Runtime
//!
//! Process wiring of the operator binary: startup, one kube-runtime
//! controller per managed kind, and the error policy that spaces retries.

mod error_policy;
mod initialization;
mod watch_loop;

pub use error_policy::handle_reconciliation_error;
pub use initialization::{initialize, InitializationResult};
pub use watch_loop::{run_watch_loop, ControllerData};

use crate::config::ControllerConfig;

/// Initialize, then run the controllers until a shutdown signal
pub async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let init = initialize(config).await?;
    run_watch_loop(init).await
}
