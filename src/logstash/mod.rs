//! # Logstash
//!
//! Step pipeline for `Logstash` resources:
//!
//! 1. `ConfigMap`s `<name>-ls-config` and `<name>-ls-pipeline`, merging
//!    inline pipelines with every `LogstashPipeline` that references it
//! 2. `Secret` `<name>-ls-credentials`, a copy of the Elasticsearch credentials
//! 3. `Service`s `<name>-ls-headless` and `<name>-ls`
//! 4. `StatefulSet` `<name>-ls`, rolled on referenced data changes
//! 5. `PodDisruptionBudget` `<name>-ls` when configured or replicated
//!
//! `LogstashPipeline` objects may live in any namespace, so the Logstash
//! holds them with a finalizer instead of an owner reference. A deleted
//! pipeline is released only after its contribution is gone from the
//! generated ConfigMaps.

pub mod builder;

use crate::constants::{LOGSTASH_FINALIZER, PIPELINE_FINALIZER};
use crate::controller::managed::Managed;
use crate::controller::step::list_children;
use crate::controller::watch::object_ref;
use crate::controller::workload::MISSING_REFERENCE_REASON;
use crate::controller::{
    BuilderStep, ChildReconciler, Context, Driver, EdgeTable, FieldIndex, FinalizerTracker,
    ObjectKey, ObjectStore, Observed, ReconcilerError, Wait, WorkloadProbe, WorkloadStep,
};
use crate::crd::{ClusterStatus, Logstash, LogstashPipeline};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use std::sync::Arc;

pub const SECRETS_INDEX: &str = "logstash.secrets";
pub const CONFIG_MAPS_INDEX: &str = "logstash.configmaps";
/// `namespace/name` of the Logstash a pipeline contributes to
pub const PIPELINE_INDEX: &str = "pipeline.logstash";

pub type PipelineTracker = FinalizerTracker<Logstash, LogstashPipeline>;

impl Managed for Logstash {
    const COMPONENT: &'static str = "logstash";
    const FINALIZER: &'static str = LOGSTASH_FINALIZER;

    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }
}

fn namespace(ls: &Logstash) -> &str {
    ls.meta().namespace.as_deref().unwrap_or("default")
}

/// Generated ConfigMaps; holds and releases contributing pipelines
#[derive(Debug)]
pub struct PipelineConfigStep {
    tracker: Arc<PipelineTracker>,
}

impl PipelineConfigStep {
    pub fn new(tracker: Arc<PipelineTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl<S: ObjectStore> ChildReconciler<Logstash, S> for PipelineConfigStep {
    type Child = ConfigMap;
    /// Deleted pipelines still held, released once the ConfigMaps drop them
    type Refs = Vec<LogstashPipeline>;

    fn name(&self) -> &'static str {
        "configmap"
    }

    fn condition_type(&self) -> &'static str {
        "ConfigMapReady"
    }

    async fn read(
        &self,
        ls: &Logstash,
        ctx: &Context<S>,
    ) -> Result<Observed<ConfigMap, Vec<LogstashPipeline>>, ReconcilerError> {
        let tracked = self.tracker.track(ls, ctx).await?;
        let current = list_children::<Logstash, ConfigMap, S>(ls, ctx).await?;
        let expected = builder::config_maps(ls, &tracked.active)?;
        Ok(Observed {
            current,
            expected,
            refs: tracked.deleting,
            wait: None,
        })
    }

    async fn after_apply(
        &self,
        _ls: &Logstash,
        ctx: &Context<S>,
        deleting: Vec<LogstashPipeline>,
    ) -> Result<(), ReconcilerError> {
        self.tracker.release(ctx, &deleting).await
    }
}

/// Copy of the Elasticsearch credentials; waits until the source exists
#[derive(Debug, Default)]
pub struct CredentialsStep;

#[async_trait]
impl<S: ObjectStore> ChildReconciler<Logstash, S> for CredentialsStep {
    type Child = Secret;
    type Refs = ();

    fn name(&self) -> &'static str {
        "credentials"
    }

    fn condition_type(&self) -> &'static str {
        "CredentialsReady"
    }

    async fn read(&self, ls: &Logstash, ctx: &Context<S>) -> Result<Observed<Secret>, ReconcilerError> {
        let current = list_children::<Logstash, Secret, S>(ls, ctx).await?;
        let Some(source_name) = ls
            .spec
            .elasticsearch_ref
            .as_ref()
            .and_then(|es| es.credentials_secret.as_deref())
        else {
            return Ok(Observed::new(current, Vec::new()));
        };

        let key = ObjectKey::new(namespace(ls), source_name);
        match ctx.store.get::<Secret>(&key).await? {
            Some(source) => {
                let expected = vec![builder::credentials_secret(ls, &source)];
                Ok(Observed::new(current, expected))
            }
            None => Ok(Observed::waiting(
                current,
                Wait {
                    after: ctx.config.dependency_poll(),
                    reason: MISSING_REFERENCE_REASON,
                    message: format!("waiting for secret/{source_name}"),
                },
            )),
        }
    }
}

fn qualified(ls: &Logstash, names: impl IntoIterator<Item = String>) -> Vec<String> {
    let namespace = namespace(ls);
    let mut values: Vec<String> = names
        .into_iter()
        .map(|name| format!("{namespace}/{name}"))
        .collect();
    values.sort();
    values.dedup();
    values
}

pub fn secret_refs(ls: &Logstash) -> Vec<String> {
    let es = ls.spec.elasticsearch_ref.as_ref();
    let names = [
        es.and_then(|es| es.credentials_secret.clone()),
        es.and_then(|es| es.ca_secret.clone()),
    ]
    .into_iter()
    .flatten()
    .chain(ls.spec.pod.secret_names().into_iter().map(str::to_string));
    qualified(ls, names)
}

pub fn config_map_refs(ls: &Logstash) -> Vec<String> {
    qualified(
        ls,
        ls.spec.pod.config_map_names().into_iter().map(str::to_string),
    )
}

pub fn field_index() -> FieldIndex<Logstash> {
    FieldIndex::new()
        .with_index(SECRETS_INDEX, secret_refs)
        .with_index(CONFIG_MAPS_INDEX, config_map_refs)
}

pub fn pipeline_index() -> FieldIndex<LogstashPipeline> {
    FieldIndex::new().with_index(PIPELINE_INDEX, |pipeline: &LogstashPipeline| {
        vec![pipeline.target()]
    })
}

/// Logstash resources to reconcile when `pipeline` changes
///
/// The current target, plus every Logstash that held the pipeline on its
/// last pass so a moved reference is released by the old target.
pub fn pipeline_requests(edges: &EdgeTable, pipeline: &LogstashPipeline) -> Vec<ObjectKey> {
    let mut keys: Vec<ObjectKey> = ObjectKey::parse(&pipeline.target()).into_iter().collect();
    if let Ok(key) = ObjectKey::of(pipeline) {
        keys.extend(edges.parents_of(&key));
    }
    keys.sort();
    keys.dedup();
    keys
}

/// Mapper for the `LogstashPipeline` watch
///
/// Feeds `pipelines` from the event first, so the pass it triggers already
/// finds the pipeline through the index.
pub fn pipeline_mapper(
    pipelines: Arc<FieldIndex<LogstashPipeline>>,
    edges: Arc<EdgeTable>,
) -> impl Fn(LogstashPipeline) -> Vec<ObjectRef<Logstash>> + Send + Sync + Clone + 'static {
    move |pipeline: LogstashPipeline| {
        pipelines.observe(pipeline.clone());
        pipeline_requests(&edges, &pipeline)
            .iter()
            .map(object_ref::<Logstash>)
            .collect()
    }
}

/// The Logstash pipeline, in reconcile order
///
/// `pipelines` must be the index the runtime keeps in sync with the
/// `LogstashPipeline` watch; `edges` is shared with the watch mapper.
pub fn driver<S: ObjectStore>(
    ctx: Context<S>,
    pipelines: Arc<FieldIndex<LogstashPipeline>>,
    edges: Arc<EdgeTable>,
) -> Driver<Logstash, S> {
    let tracker = Arc::new(PipelineTracker::new(
        PIPELINE_FINALIZER,
        pipelines,
        PIPELINE_INDEX,
        edges,
    ));
    Driver::new(ctx, WorkloadProbe::<StatefulSet>::new(builder::API_SUFFIX))
        .with_step(PipelineConfigStep::new(Arc::clone(&tracker)))
        .with_step(CredentialsStep)
        .with_step(BuilderStep::new(
            "service",
            "ServiceReady",
            builder::services,
        ))
        .with_step(WorkloadStep::new(
            "statefulset",
            "StatefulSetReady",
            builder::stateful_set,
        ))
        .with_step(BuilderStep::new(
            "pdb",
            "PodDisruptionBudgetReady",
            builder::disruption_budget,
        ))
        .with_tracker(tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LogstashPipelineSpec, LogstashRef};
    use std::collections::BTreeSet;

    fn pipeline(namespace: &str, target: &str) -> LogstashPipeline {
        let mut pipeline = LogstashPipeline::new(
            "nginx",
            LogstashPipelineSpec {
                logstash_ref: LogstashRef {
                    name: target.to_string(),
                    namespace: Some("obs".to_string()),
                },
                pipeline: "input {}".to_string(),
                workers: None,
            },
        );
        pipeline.metadata.namespace = Some(namespace.to_string());
        pipeline
    }

    #[test]
    fn test_pipeline_requests_include_previous_holder() {
        let edges = EdgeTable::new();
        edges.record(
            &ObjectKey::new("obs", "old"),
            BTreeSet::from([ObjectKey::new("web", "nginx")]),
        );

        let keys = pipeline_requests(&edges, &pipeline("web", "new"));
        assert_eq!(
            keys,
            vec![ObjectKey::new("obs", "new"), ObjectKey::new("obs", "old")]
        );
    }

    #[test]
    fn test_pipeline_mapper_indexes_before_mapping() {
        let index = Arc::new(pipeline_index());
        let mapper = pipeline_mapper(Arc::clone(&index), Arc::new(EdgeTable::new()));

        let refs = mapper(pipeline("web", "shipper"));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "shipper");
        assert_eq!(
            index.lookup_keys(PIPELINE_INDEX, "obs/shipper"),
            vec![ObjectKey::new("web", "nginx")]
        );
    }

    #[test]
    fn test_pipeline_index_extracts_target() {
        let index = pipeline_index();
        assert_eq!(
            index.values(PIPELINE_INDEX, &pipeline("web", "shipper")),
            vec!["obs/shipper".to_string()]
        );
    }
}
