//! Reconciliation logic for clusters and machines.
//!
//! [`Reconciler`] is what the watchers call. It picks the lifecycle phase
//! for an object and turns the outcome into a requeue decision; the actual
//! work lives in [`cluster::ClusterProvisioner`] and
//! [`machine::MachineController`].

pub mod cluster;
pub mod log_relay;
pub mod machine;
pub mod nodes;

use crate::backoff::BackoffTracker;
use crate::error::ControllerError;
use cluster::ClusterProvisioner;
use conditions::ConditionType;
use crds::{Cluster, Machine};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use machine::MachineController;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CLUSTER_MACHINES_CREATED: ConditionType = ConditionType::new("MachinesCreated");
pub const CLUSTER_PROVISIONED: ConditionType = ConditionType::new("Provisioned");
pub const CLUSTER_UPDATED: ConditionType = ConditionType::new("Updated");
pub const CLUSTER_REMOVED: ConditionType = ConditionType::new("Removed");
pub const CLUSTER_READY: ConditionType = ConditionType::new("Ready");

pub const MACHINE_INITIALIZED: ConditionType = ConditionType::new("Initialized");
pub const MACHINE_PROVISIONED: ConditionType = ConditionType::new("Provisioned");
pub const MACHINE_CONFIG_SAVED: ConditionType = ConditionType::new("ConfigSaved");
pub const MACHINE_READY: ConditionType = ConditionType::new("Ready");

/// Entry point of the watchers.
pub struct Reconciler {
    clusters: ClusterProvisioner,
    machines: MachineController,
    error_backoff: BackoffTracker,
    not_ready_requeue: Duration,
}

impl Reconciler {
    pub fn new(clusters: ClusterProvisioner, machines: MachineController, not_ready_requeue: Duration) -> Self {
        Self {
            clusters,
            machines,
            error_backoff: BackoffTracker::for_errors(),
            not_ready_requeue,
        }
    }

    pub async fn apply_cluster(&self, cluster: Arc<Cluster>) -> Result<Action, ControllerError> {
        let key = cluster_key(&cluster);
        let cluster = cluster.as_ref().clone();
        let result = if CLUSTER_PROVISIONED.is_true(&cluster) {
            self.clusters.updated(cluster).await
        } else {
            self.clusters.create(cluster).await
        };
        self.settle(&key, result.map(|_| ()))
    }

    pub async fn cleanup_cluster(&self, cluster: Arc<Cluster>) -> Result<Action, ControllerError> {
        let key = cluster_key(&cluster);
        let result = self.clusters.remove(cluster.as_ref().clone()).await;
        self.settle(&key, result.map(|_| ()))
    }

    pub async fn apply_machine(&self, machine: Arc<Machine>) -> Result<Action, ControllerError> {
        let key = machine_key(&machine);
        let result = self.reconcile_machine(machine.as_ref().clone()).await;
        self.settle(&key, result.map(|_| ()))
    }

    async fn reconcile_machine(&self, machine: Machine) -> Result<Machine, ControllerError> {
        let machine = self.machines.create(machine).await?;
        if MACHINE_INITIALIZED.is_true(&machine) && machine.spec.custom_config.is_none() {
            return self.machines.updated(machine).await;
        }
        Ok(machine)
    }

    pub async fn cleanup_machine(&self, machine: Arc<Machine>) -> Result<Action, ControllerError> {
        let key = machine_key(&machine);
        let result = self.machines.remove(machine.as_ref().clone()).await;
        self.settle(&key, result.map(|_| ()))
    }

    /// Maps a reconcile outcome to the next action.
    ///
    /// Not-ready outcomes requeue quietly; everything else is handed to the
    /// error policy.
    fn settle(&self, key: &str, result: Result<(), ControllerError>) -> Result<Action, ControllerError> {
        match result {
            Ok(()) => {
                self.error_backoff.reset(key);
                Ok(Action::await_change())
            }
            Err(ControllerError::NotReady { reason, message }) => {
                debug!(object = %key, reason = %reason, "{}", message);
                Ok(Action::requeue(self.not_ready_requeue))
            }
            Err(e) => Err(e),
        }
    }

    /// Delay before retrying an object whose reconcile failed.
    pub fn error_backoff(&self, key: &str) -> Duration {
        self.error_backoff.record_failure(key)
    }
}

pub fn cluster_key(cluster: &Cluster) -> String {
    format!("cluster/{}", cluster.name_any())
}

pub fn machine_key(machine: &Machine) -> String {
    format!("machine/{}/{}", machine.namespace().unwrap_or_default(), machine.name_any())
}
