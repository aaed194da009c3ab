//! Kubernetes resource watchers.
//!
//! One `kube_runtime::Controller` per root kind. Both install a finalizer so
//! teardown runs before the object disappears; the cluster controller also
//! watches machines so that a machine acquiring its node-config re-enqueues
//! its cluster.

use crate::error::ControllerError;
use crate::reconciler::cluster::machine_changed;
use crate::reconciler::{Reconciler, cluster_key, machine_key};
use conditions::StoreError;
use crds::{Cluster, Machine};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::finalizer::{Error as FinalizerError, Event, finalizer};
use kube_runtime::{Controller, watcher};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub const CLUSTER_FINALIZER: &str = "clusterforge.io/cluster-provisioner";
pub const MACHINE_FINALIZER: &str = "clusterforge.io/machine-controller";

type ReconcileResult = Result<Action, FinalizerError<ControllerError>>;

/// Debounce batches the status writes a reconcile makes itself; the
/// concurrency limit bounds parallel driver and host commands.
fn controller_config() -> ControllerConfig {
    ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3)
}

async fn log_result<K: Debug, E: std::fmt::Display>(kind: &str, res: Result<K, E>) {
    match res {
        Ok(obj) => debug!("Reconciled {} {:?}", kind, obj),
        Err(e) => error!("Controller error for {}: {}", kind, e),
    }
}

/// Watches clusters and machines for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    watch_namespace: Option<String>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            reconciler,
            client,
            watch_namespace,
        }
    }

    fn machines_api(&self) -> Api<Machine> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        info!("Starting Cluster watcher");
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let client = self.client.clone();

        let reconcile = move |cluster: Arc<Cluster>, reconciler: Arc<Reconciler>| {
            let client = client.clone();
            async move { reconcile_cluster(cluster, reconciler, client).await }
        };

        Controller::new(clusters, watcher::Config::default())
            .watches(self.machines_api(), watcher::Config::default(), machine_changed)
            .with_config(controller_config())
            .run(reconcile, cluster_error_policy, Arc::clone(&self.reconciler))
            .for_each(|res| log_result("Cluster", res))
            .await;

        Err(ControllerError::Watch("Cluster watch stream ended".to_string()))
    }

    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        info!(
            "Starting Machine watcher in {}",
            self.watch_namespace.as_deref().unwrap_or("all namespaces")
        );
        let client = self.client.clone();

        let reconcile = move |machine: Arc<Machine>, reconciler: Arc<Reconciler>| {
            let client = client.clone();
            async move { reconcile_machine(machine, reconciler, client).await }
        };

        Controller::new(self.machines_api(), watcher::Config::default())
            .with_config(controller_config())
            .run(reconcile, machine_error_policy, Arc::clone(&self.reconciler))
            .for_each(|res| log_result("Machine", res))
            .await;

        Err(ControllerError::Watch("Machine watch stream ended".to_string()))
    }
}

async fn reconcile_cluster(cluster: Arc<Cluster>, reconciler: Arc<Reconciler>, client: Client) -> ReconcileResult {
    debug!("Reconciling Cluster {}", cluster.name_any());
    let api: Api<Cluster> = Api::all(client.clone());

    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Event::Apply(cluster) => {
                ensure_namespace(&client, &cluster.name_any()).await?;
                reconciler.apply_cluster(cluster).await
            }
            Event::Cleanup(cluster) => {
                info!("Cleaning up Cluster {}", cluster.name_any());
                reconciler.cleanup_cluster(cluster).await
            }
        }
    })
    .await
}

async fn reconcile_machine(machine: Arc<Machine>, reconciler: Arc<Reconciler>, client: Client) -> ReconcileResult {
    debug!("Reconciling Machine {}", machine_key(&machine));
    let api: Api<Machine> = Api::namespaced(client, &machine.namespace().unwrap_or_default());

    finalizer(&api, MACHINE_FINALIZER, machine, |event| async {
        match event {
            Event::Apply(machine) => reconciler.apply_machine(machine).await,
            Event::Cleanup(machine) => {
                info!("Cleaning up Machine {}", machine_key(&machine));
                reconciler.cleanup_machine(machine).await
            }
        }
    })
    .await
}

fn cluster_error_policy(cluster: Arc<Cluster>, error: &FinalizerError<ControllerError>, reconciler: Arc<Reconciler>) -> Action {
    let key = cluster_key(&cluster);
    let delay = reconciler.error_backoff(&key);
    error!("Reconciliation error for {}: {} (retrying in {}s)", key, error, delay.as_secs());
    Action::requeue(delay)
}

fn machine_error_policy(machine: Arc<Machine>, error: &FinalizerError<ControllerError>, reconciler: Arc<Reconciler>) -> Action {
    let key = machine_key(&machine);
    let delay = reconciler.error_backoff(&key);
    error!("Reconciliation error for {}: {} (retrying in {}s)", key, error, delay.as_secs());
    Action::requeue(delay)
}

/// Machines of a cluster live in the namespace named after it.
async fn ensure_namespace(client: &Client, name: &str) -> Result<(), ControllerError> {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await?.is_some() {
        return Ok(());
    }

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!("Created namespace {} for Cluster {}", name, name);
            Ok(())
        }
        Err(e) => match StoreError::from(e) {
            StoreError::AlreadyExists(_) => Ok(()),
            other => Err(other.into()),
        },
    }
}
