//! Clusterforge provisioning controller
//!
//! Reconciles two custom resources:
//! - Cluster: drives a cluster driver once enough member machines are ready
//! - Machine: provisions a host and derives the node-config the cluster
//!   driver consumes

mod backoff;
mod config;
mod controller;
mod error;
mod host;
mod reconciler;
mod watcher;
mod workdir;

#[cfg(test)]
mod test_utils;

use crate::config::ProvisionerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    // kube and reqwest both build rustls clients; pick the provider once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Clusterforge provisioning controller");

    let config = ProvisionerConfig::from_env()?;
    info!("Configuration:");
    info!("  Watch namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Store namespace: {}", config.store_namespace);
    info!("  Work root: {}", config.work_root.display());
    info!("  Cluster driver: {}", config.cluster_driver_bin);
    info!("  Machine driver: {}", config.machine_driver_bin);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
