//! Main controller implementation.
//!
//! Builds the stores, the driver registry and both reconcilers, then runs
//! the Cluster and Machine watchers until one of them exits.

use crate::config::ProvisionerConfig;
use crate::error::ControllerError;
use crate::host::MachineCommand;
use crate::reconciler::Reconciler;
use crate::reconciler::cluster::{ClusterProvisioner, ClusterSettings};
use crate::reconciler::machine::{MachineController, MachineSettings};
use crate::watcher::Watcher;
use conditions::KubeStore;
use crds::{Cluster, DRIVER_RKE, Machine, MachineTemplate};
use driver_gateway::{
    CommandDriver, DiscoveryValidator, DriverGateway, DriverRegistry, EncryptedStore, KubeconfigExchanger,
    SecretStore, StoreDialer,
};
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Runs the cluster and machine watchers.
pub struct Controller {
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    pub async fn new(config: ProvisionerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Clusterforge provisioning controller");

        let client = Client::try_default().await?;

        let blobs: Arc<dyn EncryptedStore> = Arc::new(SecretStore::new(client.clone(), &config.store_namespace));
        let clusters = Arc::new(KubeStore::<Cluster>::cluster(client.clone()));
        let machines = Arc::new(KubeStore::<Machine>::namespaced(client.clone()));
        let templates = Arc::new(KubeStore::<MachineTemplate>::namespaced(client.clone()));

        let registry = DriverRegistry::new().with(
            DRIVER_RKE,
            Arc::new(CommandDriver::new(&config.cluster_driver_bin, config.work_root.join("clusters"))),
        );
        let gateway = DriverGateway::new(registry, Arc::new(StoreDialer::new(Arc::clone(&blobs))));

        let provisioner = ClusterProvisioner::new(
            clusters.clone(),
            machines.clone(),
            gateway,
            Arc::new(DiscoveryValidator::default()),
            Arc::new(KubeconfigExchanger::default()),
            ClusterSettings::from(&config),
        );
        let machine_controller = MachineController::new(
            machines,
            clusters,
            templates,
            Arc::new(MachineCommand::new(&config.machine_driver_bin)),
            blobs,
            MachineSettings::from(&config),
        );
        let reconciler = Arc::new(Reconciler::new(provisioner, machine_controller, config.not_ready_requeue));

        let watcher = Arc::new(Watcher::new(reconciler, client, config.watch_namespace.clone()));

        let cluster_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_clusters().await })
        };
        let machine_watcher = {
            let watcher = watcher;
            tokio::spawn(async move { watcher.watch_machines().await })
        };

        Ok(Self {
            cluster_watcher,
            machine_watcher,
        })
    }

    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Clusterforge provisioning controller running");

        // Watchers run forever; the first one to exit ends the process.
        tokio::select! {
            result = &mut self.cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Cluster watcher panicked: {}", e)))??;
            }
            result = &mut self.machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Machine watcher panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
