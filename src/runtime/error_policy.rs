//! # Error Policy
//!
//! Requeue delay after a failed pass. The driver has already recorded the
//! failed condition and the error metric; this only spaces the retries.

use crate::controller::{Managed, ReconcilerError};
use crate::runtime::watch_loop::ControllerData;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{error, info};

/// Handle reconciliation errors with a per-resource Fibonacci backoff
pub fn handle_reconciliation_error<P: Managed>(
    obj: Arc<P>,
    error: &ReconcilerError,
    data: Arc<ControllerData<P>>,
) -> Action {
    let name = obj.meta().name.as_deref().unwrap_or("unknown");
    let namespace = obj.meta().namespace.as_deref().unwrap_or("default");

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        kind = P::COMPONENT,
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {}", namespace, name, error);

    let (delay, error_count) = data.backoff.next(&backoff_key::<P>(namespace, name));
    info!(
        backoff_secs = delay.as_secs(),
        error_count, "Retrying with Fibonacci backoff"
    );

    data.metrics()
        .increment_requeues(P::COMPONENT, "ErrorBackoff");
    Action::requeue(delay)
}

/// Backoff registry key, `kind/namespace/name`
pub(crate) fn backoff_key<P: Managed>(namespace: &str, name: &str) -> String {
    format!("{}/{namespace}/{name}", P::COMPONENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Kibana;

    #[test]
    fn test_backoff_key_includes_kind() {
        assert_eq!(backoff_key::<Kibana>("obs", "logs"), "kibana/obs/logs");
    }
}
