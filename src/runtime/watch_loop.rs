//! # Watch Loop
//!
//! One kube-runtime `Controller` per managed kind. Each controller watches
//! its own resources, the children it owns, and the Secrets and ConfigMaps
//! its field indexes map back to referencing resources.

use crate::config::SharedControllerConfig;
use crate::constants::COMPONENT_LABEL;
use crate::controller::watch::index_mapper;
use crate::controller::{
    backoff::BackoffRegistry, Context, Driver, EdgeTable, FieldIndex, KubeStore, Managed, Object,
    ObjectKey, ReconcileOutcome, ReconcilerError,
};
use crate::crd::{Kibana, Logstash, LogstashPipeline};
use crate::observability::Metrics;
use crate::runtime::error_policy::{backoff_key, handle_reconciliation_error};
use crate::runtime::InitializationResult;
use crate::server::ServerState;
use crate::{kibana, logstash};
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::Client;
use kube_runtime::{controller, controller::Action, watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-kind state handed to every reconcile call
pub struct ControllerData<P: Managed> {
    pub driver: Driver<P, KubeStore>,
    pub backoff: BackoffRegistry,
    /// Spec index of `P`, refreshed from every object the controller hands us
    pub index: Arc<FieldIndex<P>>,
}

impl<P: Managed> std::fmt::Debug for ControllerData<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerData")
            .field("kind", &P::COMPONENT)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<P: Managed> ControllerData<P> {
    pub fn new(driver: Driver<P, KubeStore>, index: Arc<FieldIndex<P>>) -> Self {
        let config = &driver.context().config;
        let backoff = BackoffRegistry::new(config.backoff_min(), config.backoff_max());
        Self {
            driver,
            backoff,
            index,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.driver.context().metrics
    }
}

async fn reconcile<P: Managed>(
    obj: Arc<P>,
    data: Arc<ControllerData<P>>,
) -> Result<Action, ReconcilerError> {
    let key = ObjectKey::of(obj.as_ref())?;
    // The index watch may not have delivered this version yet
    data.index.observe(obj.as_ref().clone());
    let outcome = data.driver.reconcile(&key).await?;
    data.backoff
        .reset(&backoff_key::<P>(&key.namespace, &key.name));
    Ok(match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
    })
}

fn report<P: Managed, E: std::fmt::Display>(
    result: Result<(ObjectRef<P>, Action), E>,
) -> future::Ready<()> {
    match result {
        Ok((obj, action)) => {
            debug!(kind = P::COMPONENT, resource = %obj, ?action, "reconcile completed");
        }
        Err(e) => warn!(kind = P::COMPONENT, error = %e, "controller error"),
    }
    future::ready(())
}

fn api<K: Object>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Children carry the component label, so owned watches skip unrelated objects
fn owned<P: Managed>() -> watcher::Config {
    watcher::Config::default().labels(&format!("{COMPONENT_LABEL}={}", P::COMPONENT))
}

/// Keep `index` fed, restarting its watch after `restart_delay` until shutdown
fn spawn_index<K: Object>(
    index: Arc<FieldIndex<K>>,
    api: Api<K>,
    restart_delay: Duration,
    server_state: Arc<ServerState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            Arc::clone(&index).run(api.clone()).await;
            if !server_state.is_ready() {
                break;
            }
            warn!(kind = %K::kind(&()), "field index watch ended, restarting");
            tokio::time::sleep(restart_delay).await;
        }
    })
}

/// Run the Kibana and Logstash controllers until shutdown
pub async fn run_watch_loop(init: InitializationResult) -> Result<(), anyhow::Error> {
    let InitializationResult {
        client,
        server_state,
        metrics,
        controller_config,
    } = init;
    let namespace = controller_config.watch_namespace.as_deref();
    let restart_delay = controller_config.watch_restart_delay();

    // Mark not ready as soon as a shutdown is requested
    let shutdown_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, initiating graceful shutdown...");
        shutdown_state.set_ready(false);
    });

    let store = Arc::new(KubeStore::new(client.clone()));
    let ctx = Context::new(store, metrics, Arc::clone(&controller_config));

    let kibana_index = Arc::new(kibana::field_index());
    let logstash_index = Arc::new(logstash::field_index());
    let pipeline_index = Arc::new(logstash::pipeline_index());
    let edges = Arc::new(EdgeTable::new());

    let index_tasks = [
        spawn_index(
            Arc::clone(&kibana_index),
            api::<Kibana>(&client, namespace),
            restart_delay,
            Arc::clone(&server_state),
        ),
        spawn_index(
            Arc::clone(&logstash_index),
            api::<Logstash>(&client, namespace),
            restart_delay,
            Arc::clone(&server_state),
        ),
        spawn_index(
            Arc::clone(&pipeline_index),
            api::<LogstashPipeline>(&client, namespace),
            restart_delay,
            Arc::clone(&server_state),
        ),
    ];

    let kibana_data = Arc::new(ControllerData::new(
        kibana::driver(ctx.clone()),
        Arc::clone(&kibana_index),
    ));
    let logstash_data = Arc::new(ControllerData::new(
        logstash::driver(ctx, Arc::clone(&pipeline_index), Arc::clone(&edges)),
        Arc::clone(&logstash_index),
    ));

    info!("Starting controllers...");
    info!("  - Kibana controller");
    info!("  - Logstash controller");

    let kibana_controller = kibana_controller(&client, &controller_config, kibana_index)
        .run(
            reconcile::<Kibana>,
            handle_reconciliation_error::<Kibana>,
            kibana_data,
        )
        .for_each(report::<Kibana, _>);

    let logstash_controller =
        logstash_controller(&client, &controller_config, logstash_index, pipeline_index, edges)
            .run(
                reconcile::<Logstash>,
                handle_reconciliation_error::<Logstash>,
                logstash_data,
            )
            .for_each(report::<Logstash, _>);

    tokio::join!(kibana_controller, logstash_controller);

    server_state.set_ready(false);
    for task in index_tasks {
        task.abort();
    }
    info!("Controllers stopped");
    Ok(())
}

fn controller_settings(config: &SharedControllerConfig) -> controller::Config {
    controller::Config::default().concurrency(config.max_concurrent_reconciliations)
}

fn kibana_controller(
    client: &Client,
    config: &SharedControllerConfig,
    index: Arc<FieldIndex<Kibana>>,
) -> Controller<Kibana> {
    let namespace = config.watch_namespace.as_deref();
    Controller::new(
        api::<Kibana>(client, namespace),
        watcher::Config::default().any_semantic(),
    )
    .with_config(controller_settings(config))
    .owns(api::<ConfigMap>(client, namespace), owned::<Kibana>())
    .owns(api::<Secret>(client, namespace), owned::<Kibana>())
    .owns(api::<Service>(client, namespace), owned::<Kibana>())
    .owns(api::<Deployment>(client, namespace), owned::<Kibana>())
    .owns(api::<Ingress>(client, namespace), owned::<Kibana>())
    .owns(api::<PodDisruptionBudget>(client, namespace), owned::<Kibana>())
    .watches(
        api::<Secret>(client, namespace),
        watcher::Config::default(),
        index_mapper::<Kibana, Secret>(Arc::clone(&index), kibana::SECRETS_INDEX),
    )
    .watches(
        api::<ConfigMap>(client, namespace),
        watcher::Config::default(),
        index_mapper::<Kibana, ConfigMap>(index, kibana::CONFIG_MAPS_INDEX),
    )
    .shutdown_on_signal()
}

fn logstash_controller(
    client: &Client,
    config: &SharedControllerConfig,
    index: Arc<FieldIndex<Logstash>>,
    pipelines: Arc<FieldIndex<LogstashPipeline>>,
    edges: Arc<EdgeTable>,
) -> Controller<Logstash> {
    let namespace = config.watch_namespace.as_deref();
    Controller::new(
        api::<Logstash>(client, namespace),
        watcher::Config::default().any_semantic(),
    )
    .with_config(controller_settings(config))
    .owns(api::<ConfigMap>(client, namespace), owned::<Logstash>())
    .owns(api::<Secret>(client, namespace), owned::<Logstash>())
    .owns(api::<Service>(client, namespace), owned::<Logstash>())
    .owns(api::<StatefulSet>(client, namespace), owned::<Logstash>())
    .owns(api::<PodDisruptionBudget>(client, namespace), owned::<Logstash>())
    .watches(
        api::<Secret>(client, namespace),
        watcher::Config::default(),
        index_mapper::<Logstash, Secret>(Arc::clone(&index), logstash::SECRETS_INDEX),
    )
    .watches(
        api::<ConfigMap>(client, namespace),
        watcher::Config::default(),
        index_mapper::<Logstash, ConfigMap>(index, logstash::CONFIG_MAPS_INDEX),
    )
    .watches(
        api::<LogstashPipeline>(client, namespace),
        watcher::Config::default(),
        logstash::pipeline_mapper(pipelines, edges),
    )
    .shutdown_on_signal()
}
