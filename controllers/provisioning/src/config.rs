//! Controller configuration.
//!
//! Everything is read from environment variables; every tunable has a
//! default so the controller starts with an empty environment.

use crate::error::ControllerError;
use conditions::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration of the provisioning controller.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Restricts machine and template watches; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Namespace holding the encrypted-store secrets
    pub store_namespace: String,
    /// Root of machine and cluster working directories
    pub work_root: PathBuf,
    /// Host-provisioning command
    pub machine_driver_bin: String,
    /// Orchestrator command behind the `rancherKubernetesEngine` driver
    pub cluster_driver_bin: String,
    /// Cluster status persist loop
    pub status_write: RetryPolicy,
    /// Cluster driver removal loop
    pub teardown: RetryPolicy,
    /// Working-directory checkpoint cadence while a host is provisioned
    pub checkpoint_interval: Duration,
    /// Attempts per relayed driver log event
    pub log_relay_attempts: u32,
    /// Requeue delay after a not-ready outcome
    pub not_ready_requeue: Duration,
    /// Engine install script applied when a template leaves it unset
    pub default_engine_install_url: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            store_namespace: "clusterforge-system".to_string(),
            work_root: std::env::temp_dir().join("clusterforge"),
            machine_driver_bin: "docker-machine".to_string(),
            cluster_driver_bin: "rke".to_string(),
            status_write: RetryPolicy::new(20, Duration::from_millis(100)),
            teardown: RetryPolicy::new(4, Duration::from_secs(1)),
            checkpoint_interval: Duration::from_secs(5),
            log_relay_attempts: 2,
            not_ready_requeue: Duration::from_secs(15),
            default_engine_install_url: "https://get.docker.com".to_string(),
        }
    }
}

impl ProvisionerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value
    /// when it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let checkpoint_secs: u64 = parse(&get, "CHECKPOINT_INTERVAL_SECS", 5)?;
        if checkpoint_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "CHECKPOINT_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            store_namespace: get("STORE_NAMESPACE").unwrap_or(defaults.store_namespace),
            work_root: get("WORK_ROOT").map_or(defaults.work_root, PathBuf::from),
            machine_driver_bin: get("MACHINE_DRIVER_BIN").unwrap_or(defaults.machine_driver_bin),
            cluster_driver_bin: get("CLUSTER_DRIVER_BIN").unwrap_or(defaults.cluster_driver_bin),
            status_write: RetryPolicy::new(
                parse(&get, "STATUS_WRITE_ATTEMPTS", defaults.status_write.attempts)?,
                Duration::from_millis(parse(&get, "STATUS_WRITE_PAUSE_MS", 100)?),
            ),
            teardown: RetryPolicy::new(
                parse(&get, "TEARDOWN_ATTEMPTS", defaults.teardown.attempts)?,
                Duration::from_millis(parse(&get, "TEARDOWN_PAUSE_MS", 1000)?),
            ),
            checkpoint_interval: Duration::from_secs(checkpoint_secs),
            log_relay_attempts: parse(&get, "LOG_RELAY_ATTEMPTS", defaults.log_relay_attempts)?,
            not_ready_requeue: Duration::from_secs(parse(&get, "NOT_READY_REQUEUE_SECS", 15)?),
            default_engine_install_url: get("DEFAULT_ENGINE_INSTALL_URL")
                .unwrap_or(defaults.default_engine_install_url),
        })
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key} must be a number, got {raw:?}"))),
    }
}
