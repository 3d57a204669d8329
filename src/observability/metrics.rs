//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `stack_operator_reconciliations_total` - Reconcile passes by kind and result
//! - `stack_operator_reconcile_errors_total` - Failed passes by kind and error reason
//! - `stack_operator_reconcile_duration_seconds` - Pass duration by kind
//! - `stack_operator_child_writes_total` - Child create/update/delete calls by kind, child kind and operation
//! - `stack_operator_requeues_total` - Requeues by kind and reason
//! - `stack_operator_instance_ready` - 1 when a managed instance is ready, 0 otherwise
//!
//! Metrics live in a [`Metrics`] value owned by the runtime and shared with
//! each reconciler; nothing is registered globally.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric handles plus the registry they are registered in
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
    child_writes: IntCounterVec,
    requeues: IntCounterVec,
    ready: IntGaugeVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "stack_operator_reconciliations_total",
                "Total number of reconcile passes",
            ),
            &["kind", "result"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "stack_operator_reconcile_errors_total",
                "Total number of failed reconcile passes",
            ),
            &["kind", "reason"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "stack_operator_reconcile_duration_seconds",
                "Duration of reconcile passes in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["kind"],
        )?;
        let child_writes = IntCounterVec::new(
            Opts::new(
                "stack_operator_child_writes_total",
                "Total number of child object writes",
            ),
            &["kind", "child", "op"],
        )?;
        let requeues = IntCounterVec::new(
            Opts::new("stack_operator_requeues_total", "Total number of requeues"),
            &["kind", "reason"],
        )?;
        let ready = IntGaugeVec::new(
            Opts::new(
                "stack_operator_instance_ready",
                "Whether a managed instance is ready (1) or not (0)",
            ),
            &["kind", "namespace", "name"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(child_writes.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(ready.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            errors,
            duration,
            child_writes,
            requeues,
            ready,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn observe_reconcile(&self, kind: &str, result: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[kind, result]).inc();
        self.duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn increment_errors(&self, kind: &str, reason: &str) {
        self.errors.with_label_values(&[kind, reason]).inc();
    }

    pub fn increment_child_writes(&self, kind: &str, child: &str, op: &str, count: usize) {
        self.child_writes
            .with_label_values(&[kind, child, op])
            .inc_by(count as u64);
    }

    pub fn increment_requeues(&self, kind: &str, reason: &str) {
        self.requeues.with_label_values(&[kind, reason]).inc();
    }

    /// Register the per-instance series (idempotent)
    pub fn init_instance(&self, kind: &str, namespace: &str, name: &str) {
        let _ = self.ready.with_label_values(&[kind, namespace, name]);
    }

    pub fn set_ready(&self, kind: &str, namespace: &str, name: &str, ready: bool) {
        self.ready
            .with_label_values(&[kind, namespace, name])
            .set(i64::from(ready));
    }

    /// Drop the per-instance series once the instance is gone
    pub fn forget_instance(&self, kind: &str, namespace: &str, name: &str) {
        let _ = self.ready.remove_label_values(&[kind, namespace, name]);
    }

    /// Current value of the ready gauge, `None` when the series does not exist
    pub fn instance_ready(&self, kind: &str, namespace: &str, name: &str) -> Option<i64> {
        let text = String::from_utf8(self.encode().ok()?).ok()?;
        let wanted = [
            format!("kind=\"{kind}\""),
            format!("namespace=\"{namespace}\""),
            format!("name=\"{name}\""),
        ];
        text.lines()
            .filter(|line| line.starts_with("stack_operator_instance_ready{"))
            .find(|line| wanted.iter().all(|label| line.contains(label.as_str())))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    /// Current value of the error counter for `kind` and `reason`
    pub fn error_count(&self, kind: &str, reason: &str) -> u64 {
        self.errors.with_label_values(&[kind, reason]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_series_lifecycle() {
        let metrics = Metrics::new().unwrap();
        metrics.init_instance("kibana", "ns", "a");
        metrics.set_ready("kibana", "ns", "a", true);
        assert_eq!(metrics.instance_ready("kibana", "ns", "a"), Some(1));

        metrics.forget_instance("kibana", "ns", "a");
        assert_eq!(metrics.instance_ready("kibana", "ns", "a"), None);
    }

    #[test]
    fn test_error_count_per_reason() {
        let metrics = Metrics::new().unwrap();
        metrics.increment_errors("logstash", "InvalidSpec");
        metrics.increment_errors("logstash", "InvalidSpec");
        metrics.increment_errors("kibana", "InvalidSpec");
        assert_eq!(metrics.error_count("logstash", "InvalidSpec"), 2);
        assert_eq!(metrics.error_count("logstash", "BackendError"), 0);
    }

    #[test]
    fn test_encode_renders_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_reconcile("kibana", "success", Duration::from_millis(5));
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("stack_operator_reconciliations_total"));
    }
}
