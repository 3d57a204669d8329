//! # Logstash Reconcile Tests
//!
//! Cross-namespace pipeline contributions, the finalizers that hold them,
//! and the Logstash step pipeline against the in-memory store.

mod common;

use common::{context, from_yaml, key, mark_stateful_set_ready, secret, writes};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use stack_operator::constants::{LOGSTASH_FINALIZER, PIPELINE_FINALIZER};
use stack_operator::controller::store::{Fault, WriteOp};
use stack_operator::controller::{
    Context, Driver, EdgeTable, MemoryStore, ObjectKey, ReconcileOutcome,
};
use stack_operator::crd::{ClusterStatus, ConditionStatus, Logstash, LogstashPipeline, Phase};
use stack_operator::logstash;
use std::collections::BTreeSet;
use std::sync::Arc;

const SHIPPER: &str = r#"
apiVersion: stack.octopilot.io/v1
kind: Logstash
metadata:
  name: shipper
  namespace: obs
spec:
  version: 8.15.0
  pipelines:
    - id: main
      config: "input { beats { port => 5044 } }"
  elasticsearchRef:
    hosts: ["https://es-http:9200"]
    credentialsSecret: es-user
"#;

const NGINX: &str = r#"
apiVersion: stack.octopilot.io/v1
kind: LogstashPipeline
metadata:
  name: nginx
  namespace: web
spec:
  logstashRef:
    name: shipper
    namespace: obs
  pipeline: "input { http { port => 8080 } }"
"#;

fn minimal(name: &str) -> Logstash {
    from_yaml(&format!(
        r#"
apiVersion: stack.octopilot.io/v1
kind: Logstash
metadata:
  name: {name}
  namespace: obs
spec:
  version: 8.15.0
"#
    ))
}

fn nginx_key() -> ObjectKey {
    ObjectKey::new("web", "nginx")
}

struct Harness {
    ctx: Context<MemoryStore>,
    edges: Arc<EdgeTable>,
    driver: Driver<Logstash, MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let ctx = context();
        let edges = Arc::new(EdgeTable::new());
        let driver = logstash::driver(
            ctx.clone(),
            Arc::new(logstash::pipeline_index()),
            Arc::clone(&edges),
        );
        Self { ctx, edges, driver }
    }

    fn store(&self) -> &MemoryStore {
        &self.ctx.store
    }

    async fn pass(&self, name: &str) -> ReconcileOutcome {
        self.driver.reconcile(&key(name)).await.unwrap()
    }

    fn status(&self, name: &str) -> ClusterStatus {
        self.store()
            .object::<Logstash>(&key(name))
            .and_then(|ls| ls.status)
            .expect("status should be written")
    }

    /// Pipeline ids present in the definitions ConfigMap of `name`
    fn pipeline_files(&self, name: &str) -> BTreeSet<String> {
        let cm: ConfigMap = self
            .store()
            .object(&key(&format!("{name}-ls-pipeline")))
            .expect("pipeline configmap should exist");
        cm.data.unwrap_or_default().into_keys().collect()
    }

    fn pipeline_finalizers(&self) -> Vec<String> {
        self.store()
            .object::<LogstashPipeline>(&nginx_key())
            .and_then(|p| p.metadata.finalizers)
            .unwrap_or_default()
    }
}

fn files(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

#[tokio::test]
async fn test_missing_credentials_secret_waits() {
    let h = Harness::new();
    h.store().seed(&from_yaml::<Logstash>(SHIPPER)).unwrap();

    let outcome = h.pass("shipper").await;
    assert_eq!(
        outcome,
        ReconcileOutcome::RequeueAfter(h.ctx.config.dependency_poll())
    );
    assert!(h.store().object::<StatefulSet>(&key("shipper-ls")).is_none());

    let status = h.status("shipper");
    let ready = status.condition("Ready").unwrap();
    assert_eq!(ready.reason, "MissingReference");
    assert_eq!(ready.message, "waiting for secret/es-user");
    assert_eq!(
        status.condition("CredentialsReady").map(|c| c.status),
        Some(ConditionStatus::False)
    );
    assert_eq!(
        status.condition("ConfigMapReady").map(|c| c.status),
        Some(ConditionStatus::True)
    );

    h.store()
        .seed(&secret("obs", "es-user", &[("username", "logstash"), ("password", "pw")]))
        .unwrap();
    h.pass("shipper").await;

    let copy: Secret = h.store().object(&key("shipper-ls-credentials")).unwrap();
    let source: Secret = h.store().object(&key("es-user")).unwrap();
    assert_eq!(copy.data, source.data);
    assert!(h.store().object::<StatefulSet>(&key("shipper-ls")).is_some());
    assert_eq!(h.store().all::<Service>().len(), 2);
}

#[tokio::test]
async fn test_contributed_pipeline_is_held_and_rendered() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();

    h.pass("shipper").await;

    assert_eq!(h.pipeline_finalizers(), vec![PIPELINE_FINALIZER.to_string()]);
    assert_eq!(h.pipeline_files("shipper"), files(&["web-nginx.conf"]));
    assert_eq!(h.edges.parents_of(&nginx_key()), vec![key("shipper")]);

    let config: ConfigMap = h.store().object(&key("shipper-ls-config")).unwrap();
    let pipelines = &config.data.unwrap()["pipelines.yml"];
    assert!(pipelines.contains("web-nginx"));
    assert!(pipelines.contains("/usr/share/logstash/pipeline/web-nginx.conf"));
}

#[tokio::test]
async fn test_deleted_pipeline_released_after_config_drops_it() {
    let h = Harness::new();
    h.store().seed(&from_yaml::<Logstash>(SHIPPER)).unwrap();
    h.store()
        .seed(&secret("obs", "es-user", &[("username", "logstash"), ("password", "pw")]))
        .unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;
    assert_eq!(h.pipeline_files("shipper"), files(&["main.conf", "web-nginx.conf"]));

    h.store().request_delete::<LogstashPipeline>(&nginx_key());
    assert!(h.store().object::<LogstashPipeline>(&nginx_key()).is_some());
    h.store().clear_writes();

    h.pass("shipper").await;

    assert!(h.store().object::<LogstashPipeline>(&nginx_key()).is_none());
    assert_eq!(h.pipeline_files("shipper"), files(&["main.conf"]));

    let log = writes(h.store());
    let dropped = log
        .iter()
        .position(|w| w == "Apply ConfigMap obs/shipper-ls-pipeline")
        .expect("pipeline configmap applied");
    let released = log
        .iter()
        .position(|w| w == "SetFinalizers LogstashPipeline web/nginx")
        .expect("pipeline released");
    assert!(dropped < released, "released before drop: {log:?}");
}

#[tokio::test]
async fn test_moved_reference_stays_held_by_new_target() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&minimal("archive")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;

    assert!(h
        .store()
        .mutate::<LogstashPipeline>(&nginx_key(), |p| p.spec.logstash_ref.name = "archive".to_string()));
    // The old holder is reconciled through the edge table
    assert_eq!(
        logstash::pipeline_requests(
            &h.edges,
            &h.store().object::<LogstashPipeline>(&nginx_key()).unwrap()
        ),
        vec![key("archive"), key("shipper")]
    );

    h.pass("shipper").await;
    h.pass("archive").await;

    assert!(h.pipeline_files("shipper").is_empty());
    assert_eq!(h.pipeline_files("archive"), files(&["web-nginx.conf"]));
    assert_eq!(h.pipeline_finalizers(), vec![PIPELINE_FINALIZER.to_string()]);
    assert_eq!(h.edges.parents_of(&nginx_key()), vec![key("archive")]);
}

#[tokio::test]
async fn test_reference_moved_to_missing_target_is_released() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;

    assert!(h
        .store()
        .mutate::<LogstashPipeline>(&nginx_key(), |p| p.spec.logstash_ref.name = "gone".to_string()));
    h.pass("shipper").await;

    assert!(h.pipeline_finalizers().is_empty());
    assert!(h.pipeline_files("shipper").is_empty());
}

#[tokio::test]
async fn test_deleting_old_target_keeps_moved_pipeline_held() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&minimal("archive")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;

    assert!(h
        .store()
        .mutate::<LogstashPipeline>(&nginx_key(), |p| p.spec.logstash_ref.name = "archive".to_string()));
    h.pass("archive").await;
    assert_eq!(h.pipeline_files("archive"), files(&["web-nginx.conf"]));

    // shipper goes away before it saw the move
    h.store().request_delete::<Logstash>(&key("shipper"));
    assert_eq!(h.pass("shipper").await, ReconcileOutcome::Done);
    assert!(h.store().object::<Logstash>(&key("shipper")).is_none());
    assert_eq!(h.pipeline_finalizers(), vec![PIPELINE_FINALIZER.to_string()]);

    h.store().request_delete::<LogstashPipeline>(&nginx_key());
    assert!(h.store().object::<LogstashPipeline>(&nginx_key()).is_some());
    assert_eq!(h.pipeline_files("archive"), files(&["web-nginx.conf"]));

    h.pass("archive").await;
    assert!(h.pipeline_files("archive").is_empty());
    assert!(h.store().object::<LogstashPipeline>(&nginx_key()).is_none());
}

#[tokio::test]
async fn test_deletion_waits_while_pipeline_finalizer_remains() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;

    // Another client puts the finalizer straight back
    h.store()
        .inject(WriteOp::SetFinalizers, "LogstashPipeline", Fault::Lose);
    h.store().request_delete::<Logstash>(&key("shipper"));

    assert_eq!(
        h.pass("shipper").await,
        ReconcileOutcome::RequeueAfter(h.ctx.config.dependency_poll())
    );
    let ls: Logstash = h.store().object(&key("shipper")).unwrap();
    assert_eq!(ls.metadata.finalizers, Some(vec![LOGSTASH_FINALIZER.to_string()]));
    assert_eq!(h.pipeline_finalizers(), vec![PIPELINE_FINALIZER.to_string()]);

    h.store().clear_faults();
    assert_eq!(h.pass("shipper").await, ReconcileOutcome::Done);
    assert!(h.store().object::<Logstash>(&key("shipper")).is_none());
    assert!(h.pipeline_finalizers().is_empty());
}

#[tokio::test]
async fn test_failed_status_write_is_counted() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store()
        .inject(WriteOp::PatchStatus, "Logstash", Fault::Reject);

    let err = h.driver.reconcile(&key("shipper")).await.unwrap_err();
    assert_eq!(err.reason(), "BackendError");
    assert_eq!(h.ctx.metrics.error_count("logstash", "BackendError"), 1);
    assert!(h.store().object::<StatefulSet>(&key("shipper-ls")).is_some());

    h.store().clear_faults();
    h.pass("shipper").await;
    assert_eq!(h.status("shipper").phase, Phase::Starting);
    assert_eq!(h.ctx.metrics.error_count("logstash", "BackendError"), 1);
}

#[tokio::test]
async fn test_deletion_releases_pipelines_before_own_finalizer() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.store().seed(&from_yaml::<LogstashPipeline>(NGINX)).unwrap();
    h.pass("shipper").await;
    let ls: Logstash = h.store().object(&key("shipper")).unwrap();
    assert_eq!(ls.metadata.finalizers, Some(vec![LOGSTASH_FINALIZER.to_string()]));

    h.store().request_delete::<Logstash>(&key("shipper"));
    h.store().clear_writes();
    let outcome = h.pass("shipper").await;

    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(
        writes(h.store()),
        vec![
            "SetFinalizers LogstashPipeline web/nginx",
            "SetFinalizers Logstash obs/shipper",
        ]
    );
    assert!(h.pipeline_finalizers().is_empty());
    assert!(h.store().object::<Logstash>(&key("shipper")).is_none());
    assert!(h.edges.parents_of(&nginx_key()).is_empty());
}

#[tokio::test]
async fn test_ready_statefulset_converges() {
    let h = Harness::new();
    h.store().seed(&minimal("shipper")).unwrap();
    h.pass("shipper").await;

    let stateful_set: StatefulSet = h.store().object(&key("shipper-ls")).unwrap();
    let spec = stateful_set.spec.unwrap();
    assert_eq!(spec.service_name.as_deref(), Some("shipper-ls-headless"));

    mark_stateful_set_ready(h.store(), &key("shipper-ls"));
    assert_eq!(h.pass("shipper").await, ReconcileOutcome::Done);
    assert_eq!(h.status("shipper").phase, Phase::Running);

    h.store().clear_writes();
    assert_eq!(h.pass("shipper").await, ReconcileOutcome::Done);
    assert_eq!(writes(h.store()), Vec::<String>::new());
}

#[tokio::test]
async fn test_duplicate_pipeline_id_is_invalid() {
    let h = Harness::new();
    let mut ls = minimal("shipper");
    ls.spec.pipelines = vec![
        from_yaml("{id: main, config: 'input {}'}"),
        from_yaml("{id: main, config: 'input {}'}"),
    ];
    h.store().seed(&ls).unwrap();

    let err = h.driver.reconcile(&key("shipper")).await.unwrap_err();
    assert_eq!(err.reason(), "InvalidSpec");
    let status = h.status("shipper");
    assert_eq!(status.phase, Phase::Error);
    assert_eq!(
        status.condition("ConfigMapReady").map(|c| c.reason.as_str()),
        Some("InvalidSpec")
    );
}
