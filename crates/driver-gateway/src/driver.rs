//! Cluster driver trait, registry and gateway.

use crate::dialer::Dialer;
use crate::error::DriverError;
use crate::logstream::{DriverContext, DriverLogger};
use async_trait::async_trait;
use crds::DriverSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Credentials of a provisioned cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// Kubernetes API endpoint
    pub api_endpoint: String,
    /// Bearer token of the management service account
    pub service_account_token: String,
    /// Base64 encoded CA certificate
    pub ca_cert: String,
}

/// An engine that creates, updates and removes clusters.
///
/// `create` returns [`DriverError::AlreadyExists`] when the cluster is
/// already there; the gateway then retries the call as an update.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn create(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError>;

    async fn update(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError>;

    async fn remove(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<(), DriverError>;
}

/// Driver name to implementation map, built once at startup.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn ClusterDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` under `name`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, driver: Arc<dyn ClusterDriver>) -> Self {
        self.drivers.insert(name.into(), driver);
        self
    }

    /// Looks up a driver by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ClusterDriver>, DriverError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    /// Whether a driver is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }
}

/// Entry point the cluster provisioner calls.
#[derive(Clone)]
pub struct DriverGateway {
    registry: DriverRegistry,
    dialer: Arc<dyn Dialer>,
}

impl fmt::Debug for DriverGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverGateway").field("registry", &self.registry).finish_non_exhaustive()
    }
}

impl DriverGateway {
    /// Gateway over `registry`, handing `dialer` to every call.
    pub fn new(registry: DriverRegistry, dialer: Arc<dyn Dialer>) -> Self {
        Self { registry, dialer }
    }

    /// Registered drivers.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Builds the context for one driver call.
    pub fn context(&self, logger: DriverLogger, cancel: CancellationToken) -> DriverContext {
        DriverContext {
            operation_id: Uuid::new_v4(),
            logger,
            dialer: Arc::clone(&self.dialer),
            cancel,
        }
    }

    /// Creates the cluster, updating it instead if it already exists.
    pub async fn create(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        let driver = self.registry.get(&spec.driver_name)?;
        info!(cluster = %name, driver = %spec.driver_name, operation = %ctx.operation_id, "Creating cluster");
        match driver.create(ctx, name, spec).await {
            Err(DriverError::AlreadyExists) => {
                info!(cluster = %name, "Create done, updating cluster");
                driver.update(ctx, name, spec).await
            }
            other => other,
        }
    }

    /// Applies a changed spec to an existing cluster.
    pub async fn update(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        let driver = self.registry.get(&spec.driver_name)?;
        info!(cluster = %name, driver = %spec.driver_name, operation = %ctx.operation_id, "Updating cluster");
        driver.update(ctx, name, spec).await
    }

    /// Tears the cluster down.
    pub async fn remove(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<(), DriverError> {
        let driver = self.registry.get(&spec.driver_name)?;
        info!(cluster = %name, driver = %spec.driver_name, operation = %ctx.operation_id, "Removing cluster");
        driver.remove(ctx, name, spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream::log_stream;
    use crate::mock::{MockDriver, StaticDialer};

    fn gateway(driver: Arc<MockDriver>) -> DriverGateway {
        let registry = DriverRegistry::new().with("rancherKubernetesEngine", driver);
        DriverGateway::new(registry, Arc::new(StaticDialer::default()))
    }

    fn spec(driver: &str) -> DriverSpec {
        DriverSpec {
            driver_name: driver.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_falls_back_to_update_when_cluster_exists() {
        let driver = Arc::new(MockDriver::default());
        driver.set_exists(true);
        let gw = gateway(driver.clone());
        let (logger, _rx) = log_stream();
        let ctx = gw.context(logger, CancellationToken::new());

        let info = gw.create(&ctx, "c1", &spec("rancherKubernetesEngine")).await.unwrap();

        assert_eq!(info, driver.info());
        assert_eq!(driver.create_calls(), 1);
        assert_eq!(driver.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_driver_is_an_error() {
        let gw = gateway(Arc::new(MockDriver::default()));
        let (logger, _rx) = log_stream();
        let ctx = gw.context(logger, CancellationToken::new());

        let err = gw.update(&ctx, "c1", &spec("googleKubernetesEngine")).await.unwrap_err();
        assert!(matches!(err, DriverError::UnknownDriver(name) if name == "googleKubernetesEngine"));
    }
}
