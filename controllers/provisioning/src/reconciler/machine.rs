//! Machine controller.
//!
//! Custom machines describe hosts that already exist; their node-config is
//! synthesized from the supplied connection details. Templated machines are
//! created by an external host-provisioning command whose working directory
//! is checkpointed into the encrypted store while it runs.

use crate::config::ProvisionerConfig;
use crate::error::ControllerError;
use crate::host::{HostError, HostProvisioner, HostRequest};
use crate::reconciler::{MACHINE_CONFIG_SAVED, MACHINE_INITIALIZED, MACHINE_PROVISIONED, MACHINE_READY};
use crate::workdir::WorkDir;
use conditions::condition::persist_status;
use conditions::{EntityStore, RetryPolicy, StepOutcome, StoreError};
use crds::{
    Cluster, CustomConfig, Machine, MachineStatus, MachineTemplate, NodeConfig, NodeRef, ROLE_WORKER,
    engine_config_key,
};
use driver_gateway::{Connector, EncryptedStore, delete_connector, save_connector};
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSH_PORT: &str = "22";

/// Tunables of the machine controller.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Parent of the per-machine working directories
    pub work_root: PathBuf,
    /// Checkpoint cadence while a host command runs
    pub checkpoint_interval: Duration,
    /// Engine install URL for templates that set none
    pub default_engine_install_url: String,
    /// Bound on condition persistence
    pub status_write: RetryPolicy,
}

impl From<&ProvisionerConfig> for MachineSettings {
    fn from(config: &ProvisionerConfig) -> Self {
        Self {
            work_root: config.work_root.clone(),
            checkpoint_interval: config.checkpoint_interval,
            default_engine_install_url: config.default_engine_install_url.clone(),
            status_write: config.status_write,
        }
    }
}

/// Store key of a machine's checkpointed working directory.
pub fn state_key(machine: &Machine) -> String {
    format!("machine-state-{}-{}", machine.namespace().unwrap_or_default(), machine.name_any())
}

fn node_ref(machine: &Machine) -> NodeRef {
    NodeRef::new(machine.namespace().unwrap_or_default(), machine.name_any())
}

fn roles_or_worker(machine: &Machine) -> Vec<String> {
    let roles = machine.spec.roles();
    if roles.is_empty() { vec![ROLE_WORKER.to_string()] } else { roles }
}

/// Drives machines from template resolution to a saved node-config.
pub struct MachineController {
    machines: Arc<dyn EntityStore<Machine>>,
    clusters: Arc<dyn EntityStore<Cluster>>,
    templates: Arc<dyn EntityStore<MachineTemplate>>,
    host: Arc<dyn HostProvisioner>,
    blobs: Arc<dyn EncryptedStore>,
    settings: MachineSettings,
}

impl MachineController {
    pub fn new(
        machines: Arc<dyn EntityStore<Machine>>,
        clusters: Arc<dyn EntityStore<Cluster>>,
        templates: Arc<dyn EntityStore<MachineTemplate>>,
        host: Arc<dyn HostProvisioner>,
        blobs: Arc<dyn EncryptedStore>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            machines,
            clusters,
            templates,
            host,
            blobs,
            settings,
        }
    }

    fn workdir(&self, machine: &Machine) -> WorkDir {
        WorkDir::new(self.settings.work_root.join(format!(
            "machine-{}-{}",
            machine.namespace().unwrap_or_default(),
            machine.name_any()
        )))
    }

    /// Resolves a new machine.
    ///
    /// Custom machines end up Ready; templated machines end up Initialized
    /// and are provisioned by [`MachineController::updated`].
    pub async fn create(&self, machine: Machine) -> Result<Machine, ControllerError> {
        if let Some(custom) = machine.spec.custom_config.clone() {
            let machine = MACHINE_INITIALIZED
                .once(self.machines.as_ref(), machine, |m| self.adopt_custom(m, custom))
                .await
                .into_result()?;
            return MACHINE_READY
                .once(self.machines.as_ref(), machine, |m| async { StepOutcome::ok(m) })
                .await
                .into_result();
        }

        MACHINE_INITIALIZED
            .once(self.machines.as_ref(), machine, |m| self.resolve_template(m))
            .await
            .into_result()
    }

    /// Provisions an initialized templated machine.
    pub async fn updated(&self, machine: Machine) -> Result<Machine, ControllerError> {
        if machine.spec.custom_config.is_some() {
            return Ok(machine);
        }
        if !MACHINE_INITIALIZED.is_true(&machine) {
            return Err(ControllerError::waiting(format!(
                "waiting for machine {} to be initialized",
                machine.name_any()
            )));
        }

        MACHINE_READY
            .once(self.machines.as_ref(), machine, |m| self.provision(m))
            .await
            .into_result()
    }

    /// Destroys the machine's host and releases its stored state.
    ///
    /// Fails with [`ControllerError::MachineInUse`] while the owning
    /// cluster's applied spec still lists the machine.
    pub async fn remove(&self, machine: Machine) -> Result<Machine, ControllerError> {
        let node = node_ref(&machine);
        self.ensure_not_in_use(&machine, &node).await?;

        if machine.spec.custom_config.is_none()
            && let Some(hostname) = machine.status.as_ref().and_then(|s| s.hostname.clone())
        {
            let workdir = self.workdir(&machine);
            let key = state_key(&machine);
            if let Some(blob) = self.blobs.get(&key).await? {
                workdir.restore(&blob).await?;
            }
            if self.host.exists(&hostname, workdir.path()).await? {
                info!("Removing host {} of Machine {}", hostname, node);
                self.host.remove(&hostname, workdir.path()).await?;
            }
            self.blobs.delete(&key).await?;
            workdir.remove().await?;
        }

        delete_connector(self.blobs.as_ref(), &node).await?;
        info!("Machine {} removed", node);
        Ok(machine)
    }

    async fn ensure_not_in_use(&self, machine: &Machine, node: &NodeRef) -> Result<(), ControllerError> {
        let cluster = match self.clusters.get(None, &machine.spec.cluster_name).await {
            Ok(cluster) => cluster,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let node_name = node.to_string();
        let in_use = cluster
            .status
            .as_ref()
            .and_then(|s| s.applied_spec.as_ref())
            .is_some_and(|spec| spec.nodes.iter().any(|n| n.node_name == node_name));
        if in_use {
            return Err(ControllerError::MachineInUse {
                node: node_name,
                cluster: machine.spec.cluster_name.clone(),
            });
        }
        Ok(())
    }

    async fn adopt_custom(&self, mut machine: Machine, custom: CustomConfig) -> StepOutcome<Machine, ControllerError> {
        if custom.address.is_empty() || custom.ssh_key.is_empty() {
            return StepOutcome::err(
                machine,
                ControllerError::InvalidConfig("custom machine needs an address and an SSH key".to_string()),
            );
        }

        let node = node_ref(&machine);
        let hostname = machine
            .spec
            .requested_hostname
            .clone()
            .unwrap_or_else(|| machine.name_any());
        let user = custom.user.clone().filter(|u| !u.is_empty()).unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        let port = custom.port.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| DEFAULT_SSH_PORT.to_string());

        let config = NodeConfig {
            node_name: node.to_string(),
            address: custom.address.clone(),
            internal_address: custom.internal_address.clone().unwrap_or_default(),
            user: user.clone(),
            port: port.clone(),
            role: roles_or_worker(&machine),
            ssh_key: custom.ssh_key.clone(),
            hostname_override: hostname.clone(),
            labels: machine.labels().clone(),
        };

        let connector = Connector::Ssh {
            address: custom.address,
            port,
            user: user.clone(),
            private_key: custom.ssh_key,
        };
        if let Err(e) = save_connector(self.blobs.as_ref(), &node, &connector).await {
            return StepOutcome::err(machine, e);
        }

        let status = machine.status.get_or_insert_with(MachineStatus::default);
        status.hostname = Some(hostname);
        status.ssh_user = Some(user);
        status.node_config = Some(config);
        StepOutcome::ok(machine)
    }

    async fn resolve_template(&self, mut machine: Machine) -> StepOutcome<Machine, ControllerError> {
        let Some(reference) = machine.spec.template_ref.clone().filter(|r| !r.is_empty()) else {
            return StepOutcome::err(
                machine,
                ControllerError::InvalidConfig("machine has neither a template nor a custom config".to_string()),
            );
        };
        let (namespace, name) = match reference.split_once(':') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (machine.namespace().unwrap_or_default(), reference.clone()),
        };

        let template = match self.templates.get(Some(&namespace), &name).await {
            Ok(template) => template,
            Err(StoreError::NotFound(_)) => {
                return StepOutcome::err(
                    machine,
                    ControllerError::InvalidConfig(format!("machine template {namespace}:{name} not found")),
                );
            }
            Err(e) => return StepOutcome::err(machine, e),
        };

        let driver = template.spec.driver.clone();
        let config = template
            .spec
            .configs
            .get(&engine_config_key(&driver))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let driver_config = match serde_json::to_string(&config) {
            Ok(encoded) => encoded,
            Err(e) => return StepOutcome::err(machine, ControllerError::Provision(e.to_string())),
        };
        debug!("Machine {} uses template {}:{} with driver {}", machine.name_any(), namespace, name, driver);

        let hostname = machine
            .spec
            .requested_hostname
            .clone()
            .unwrap_or_else(|| machine.name_any());
        let status = machine.status.get_or_insert_with(MachineStatus::default);
        status.driver_name = Some(driver);
        status.driver_config = Some(driver_config);
        status.engine_install_url = Some(
            template
                .spec
                .engine_install_url
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| self.settings.default_engine_install_url.clone()),
        );
        status.ssh_user = Some(
            template
                .spec
                .ssh_user
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
        );
        status.hostname = Some(hostname);
        StepOutcome::ok(machine)
    }

    /// The Ready step: create the host, then record its node-config.
    async fn provision(&self, machine: Machine) -> StepOutcome<Machine, ControllerError> {
        let machine = match persist_status(self.machines.as_ref(), machine.clone(), self.settings.status_write).await {
            Ok(saved) => saved,
            Err(e) => return StepOutcome::err(machine, e),
        };

        let workdir = self.workdir(&machine);
        if let Err(e) = self.restore(&machine, &workdir).await {
            return StepOutcome::err(machine, e);
        }

        let StepOutcome { object: machine, result } = MACHINE_PROVISIONED
            .once(self.machines.as_ref(), machine, |m| self.create_host(m, &workdir))
            .await;
        if let Err(e) = result {
            return StepOutcome::err(machine, e);
        }

        MACHINE_CONFIG_SAVED
            .once(self.machines.as_ref(), machine, |m| self.save_config(m, &workdir))
            .await
    }

    async fn restore(&self, machine: &Machine, workdir: &WorkDir) -> Result<(), ControllerError> {
        match self.blobs.get(&state_key(machine)).await? {
            Some(blob) => workdir.restore(&blob).await?,
            None => tokio::fs::create_dir_all(workdir.path()).await?,
        }
        Ok(())
    }

    /// Runs the host-provisioning command while checkpointing the working
    /// directory every `checkpoint_interval`.
    async fn create_host(&self, machine: Machine, workdir: &WorkDir) -> StepOutcome<Machine, ControllerError> {
        let request = match host_request(&machine) {
            Ok(request) => request,
            Err(e) => return StepOutcome::err(machine, e),
        };
        let key = state_key(&machine);
        info!("Provisioning host {} for Machine {}", request.hostname, machine.name_any());

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let host = Arc::clone(&self.host);
        let storage = workdir.path().to_path_buf();
        let hostname = request.hostname.clone();
        let command = tokio::spawn(async move {
            let result = host.create(&request, &storage).await;
            let _ = done_tx.send(());
            result
        });
        let checkpoints = tokio::spawn(checkpoint_loop(
            Arc::clone(&self.blobs),
            key.clone(),
            workdir.clone(),
            self.settings.checkpoint_interval,
            done_rx,
        ));
        let (command, checkpoints) = tokio::join!(command, checkpoints);

        if let Err(e) = checkpoints {
            warn!(machine = %machine.name_any(), error = %e, "Checkpoint task failed");
        }
        if let Err(e) = checkpoint(self.blobs.as_ref(), &key, workdir).await {
            return match command {
                Ok(Err(host_err)) if !matches!(host_err, HostError::AlreadyExists(_)) => {
                    warn!(machine = %machine.name_any(), error = %host_err, "Host command failed");
                    let err = ControllerError::Provision(format!("{host_err}; final checkpoint failed: {e}"));
                    StepOutcome::err(machine, err)
                }
                _ => StepOutcome::err(machine, e),
            };
        }

        match command {
            Ok(Ok(())) => StepOutcome::ok(machine),
            Ok(Err(HostError::AlreadyExists(_))) => {
                info!("Host {} already exists, continuing", hostname);
                StepOutcome::ok(machine)
            }
            Ok(Err(e)) => StepOutcome::err(machine, e),
            Err(e) => StepOutcome::err(machine, ControllerError::Provision(format!("host command task failed: {e}"))),
        }
    }

    /// Reads the provisioned host's address and key from the working
    /// directory and records the node-config.
    async fn save_config(&self, mut machine: Machine, workdir: &WorkDir) -> StepOutcome<Machine, ControllerError> {
        let status = machine.status.clone().unwrap_or_default();
        let hostname = status.hostname.clone().unwrap_or_else(|| machine.name_any());
        let host_dir = workdir.path().join("machines").join(&hostname);

        let details = match read_host_details(&host_dir).await {
            Ok(details) => details,
            Err(e) => return StepOutcome::err(machine, e),
        };
        if details.address.is_empty() {
            return StepOutcome::err(
                machine,
                ControllerError::Provision(format!("host {hostname} has no IP address")),
            );
        }

        let node = node_ref(&machine);
        let user = status
            .ssh_user
            .clone()
            .or(details.user)
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        let port = details.port.unwrap_or_else(|| DEFAULT_SSH_PORT.to_string());
        let config = NodeConfig {
            node_name: node.to_string(),
            address: details.address.clone(),
            internal_address: details.internal_address,
            user: user.clone(),
            port: port.clone(),
            role: roles_or_worker(&machine),
            ssh_key: details.ssh_key.clone(),
            hostname_override: hostname,
            labels: machine.labels().clone(),
        };

        let connector = Connector::Ssh {
            address: details.address,
            port,
            user,
            private_key: details.ssh_key,
        };
        if let Err(e) = save_connector(self.blobs.as_ref(), &node, &connector).await {
            return StepOutcome::err(machine, e);
        }

        machine.status.get_or_insert_with(MachineStatus::default).node_config = Some(config);
        StepOutcome::ok(machine)
    }
}

fn host_request(machine: &Machine) -> Result<HostRequest, ControllerError> {
    let status = machine.status.clone().unwrap_or_default();
    let driver = status
        .driver_name
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ControllerError::waiting("waiting for machine template to be resolved"))?;
    let config = match status.driver_config.as_deref() {
        Some(encoded) if !encoded.is_empty() => serde_json::from_str::<Map<String, Value>>(encoded)
            .map_err(|e| ControllerError::InvalidConfig(format!("driver config is not a JSON object: {e}")))?,
        _ => Map::new(),
    };
    Ok(HostRequest {
        hostname: status.hostname.unwrap_or_else(|| machine.name_any()),
        driver,
        engine_install_url: status.engine_install_url.unwrap_or_default(),
        config,
    })
}

async fn checkpoint(blobs: &dyn EncryptedStore, key: &str, workdir: &WorkDir) -> Result<(), ControllerError> {
    let blob = workdir.snapshot().await?;
    blobs.put(key, &blob).await?;
    Ok(())
}

/// Saves the working directory on every tick until `done` fires.
async fn checkpoint_loop(
    blobs: Arc<dyn EncryptedStore>,
    key: String,
    workdir: WorkDir,
    every: Duration,
    mut done: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = &mut done => break,
            _ = ticker.tick() => {
                match checkpoint(blobs.as_ref(), &key, &workdir).await {
                    Ok(()) => debug!("Checkpointed {}", key),
                    Err(e) => warn!(key = %key, error = %e, "Checkpoint failed"),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct HostDetails {
    address: String,
    internal_address: String,
    user: Option<String>,
    port: Option<String>,
    ssh_key: String,
}

/// Parses `config.json` and `id_rsa` of a provisioned host.
async fn read_host_details(host_dir: &std::path::Path) -> Result<HostDetails, ControllerError> {
    let raw = tokio::fs::read(host_dir.join("config.json")).await?;
    let config: Value = serde_json::from_slice(&raw)
        .map_err(|e| ControllerError::Provision(format!("invalid host config: {e}")))?;
    let driver = &config["Driver"];

    let text = |field: &str| match &driver[field] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    let ssh_key = match tokio::fs::read_to_string(host_dir.join("id_rsa")).await {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    Ok(HostDetails {
        address: text("IPAddress").unwrap_or_default(),
        internal_address: text("PrivateIPAddress").unwrap_or_default(),
        user: text("SSHUser"),
        port: text("SSHPort"),
        ssh_key,
    })
}

#[cfg(test)]
#[path = "machine_test.rs"]
mod machine_test;
