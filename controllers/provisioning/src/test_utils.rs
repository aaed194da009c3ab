//! Test fixtures shared by the reconciler tests.

use crate::config::ProvisionerConfig;
use crate::host::{HostError, HostProvisioner, HostRequest};
use crate::reconciler::Reconciler;
use crate::reconciler::cluster::{ClusterProvisioner, ClusterSettings};
use crate::reconciler::machine::{MachineController, MachineSettings};
use async_trait::async_trait;
use conditions::{MemoryStore, RetryPolicy};
use crds::*;
use driver_gateway::mock::{MemoryEncryptedStore, MockDriver, StaticDialer, StaticExchanger, StaticValidator};
use driver_gateway::{ClusterInfo, DriverGateway, DriverRegistry};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cluster using the orchestrator driver with an empty engine config.
pub fn cluster(name: &str, nodes: Vec<ClusterNodeSpec>) -> Cluster {
    let mut engines = BTreeMap::new();
    engines.insert(engine_config_key(DRIVER_RKE), json!({}));
    Cluster::new(
        name,
        ClusterSpec {
            nodes,
            engines,
            ..Default::default()
        },
    )
}

pub fn node_spec(hostname: &str, roles: &[&str]) -> ClusterNodeSpec {
    ClusterNodeSpec {
        hostname: hostname.to_string(),
        etcd: roles.contains(&ROLE_ETCD),
        control_plane: roles.contains(&ROLE_CONTROLPLANE),
        worker: roles.contains(&ROLE_WORKER),
        template: Some("c1:small".to_string()),
        ..Default::default()
    }
}

/// Machine of `cluster` that already has a node-config.
pub fn ready_machine(cluster: &str, name: &str, roles: &[&str], address: &str) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster.to_string(),
            requested_hostname: Some(name.to_string()),
            etcd: roles.contains(&ROLE_ETCD),
            control_plane: roles.contains(&ROLE_CONTROLPLANE),
            worker: roles.contains(&ROLE_WORKER),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(cluster.to_string());
    machine.status = Some(MachineStatus {
        hostname: Some(name.to_string()),
        node_config: Some(NodeConfig {
            node_name: format!("{cluster}:{name}"),
            address: address.to_string(),
            user: "root".to_string(),
            port: "22".to_string(),
            role: roles.iter().map(|r| r.to_string()).collect(),
            ssh_key: "KEY".to_string(),
            hostname_override: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    machine
}

/// Machine created from the `c1:small` template.
pub fn templated_machine(cluster: &str, name: &str, roles: &[&str]) -> Machine {
    let mut machine = ready_machine(cluster, name, roles, "");
    machine.spec.template_ref = Some(format!("{cluster}:small"));
    machine.status = None;
    machine
}

pub fn custom_machine(cluster: &str, name: &str, roles: &[&str]) -> Machine {
    let mut machine = templated_machine(cluster, name, roles);
    machine.spec.template_ref = None;
    machine.spec.custom_config = Some(CustomConfig {
        address: "203.0.113.10".to_string(),
        internal_address: Some("10.0.0.10".to_string()),
        user: Some("ubuntu".to_string()),
        port: None,
        ssh_key: "CUSTOM KEY".to_string(),
    });
    machine
}

pub fn template(namespace: &str, name: &str) -> MachineTemplate {
    let mut configs = BTreeMap::new();
    configs.insert(
        engine_config_key("amazonec2"),
        json!({ "region": "us-west-2", "instanceType": "t3.large" }),
    );
    let mut template = MachineTemplate::new(
        name,
        MachineTemplateSpec {
            driver: "amazonec2".to_string(),
            configs,
            ..Default::default()
        },
    );
    template.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };
    template
}

/// What [`ScriptedHost::create`] does after writing the host files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Succeed,
    AlreadyExists,
    Fail,
}

/// [`HostProvisioner`] that lays out docker-machine style host files.
#[derive(Debug)]
pub struct ScriptedHost {
    outcome: Mutex<HostOutcome>,
    delay: Duration,
    create_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    requests: Mutex<Vec<HostRequest>>,
}

impl ScriptedHost {
    pub fn new(outcome: HostOutcome) -> Self {
        Self::with_delay(outcome, Duration::ZERO)
    }

    pub fn with_delay(outcome: HostOutcome, delay: Duration) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            delay,
            create_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_outcome(&self, outcome: HostOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<HostRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HostProvisioner for ScriptedHost {
    async fn create(&self, request: &HostRequest, storage: &Path) -> Result<(), HostError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let outcome = *self.outcome.lock().unwrap();

        let dir = storage.join("machines").join(&request.hostname);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        if outcome == HostOutcome::Fail {
            tokio::fs::write(dir.join("partial"), "downloaded").await.unwrap();
        } else {
            let config = json!({
                "Driver": {
                    "IPAddress": "198.51.100.7",
                    "PrivateIPAddress": "10.1.0.7",
                    "SSHUser": "ubuntu",
                    "SSHPort": 22
                }
            });
            tokio::fs::write(dir.join("config.json"), config.to_string()).await.unwrap();
            tokio::fs::write(dir.join("id_rsa"), "HOST KEY").await.unwrap();
        }
        tokio::time::sleep(self.delay).await;

        match outcome {
            HostOutcome::Succeed => Ok(()),
            HostOutcome::AlreadyExists => Err(HostError::AlreadyExists(request.hostname.clone())),
            HostOutcome::Fail => Err(HostError::Command {
                command: "scripted create".to_string(),
                message: "quota exceeded".to_string(),
            }),
        }
    }

    async fn exists(&self, hostname: &str, storage: &Path) -> Result<bool, HostError> {
        Ok(storage.join("machines").join(hostname).exists())
    }

    async fn remove(&self, hostname: &str, storage: &Path) -> Result<(), HostError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let _ = tokio::fs::remove_dir_all(storage.join("machines").join(hostname)).await;
        Ok(())
    }
}

/// In-memory wiring of both controllers.
pub struct Harness {
    pub clusters: MemoryStore<Cluster>,
    pub machines: MemoryStore<Machine>,
    pub templates: MemoryStore<MachineTemplate>,
    pub driver: Arc<MockDriver>,
    pub validator: Arc<StaticValidator>,
    pub exchanger: Arc<StaticExchanger>,
    pub blobs: Arc<MemoryEncryptedStore>,
    pub host: Arc<ScriptedHost>,
    pub config: ProvisionerConfig,
    pub work: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let work = tempfile::tempdir().unwrap();
        let config = ProvisionerConfig {
            work_root: work.path().to_path_buf(),
            status_write: RetryPolicy::new(20, Duration::ZERO),
            teardown: RetryPolicy::new(4, Duration::ZERO),
            checkpoint_interval: Duration::from_millis(50),
            ..Default::default()
        };
        Self {
            clusters: MemoryStore::new(),
            machines: MemoryStore::new(),
            templates: MemoryStore::new(),
            driver: Arc::new(MockDriver::default()),
            validator: Arc::new(StaticValidator::default()),
            exchanger: Arc::new(StaticExchanger::new(ClusterInfo {
                api_endpoint: "https://imported.example:6443".to_string(),
                service_account_token: "imported-token".to_string(),
                ca_cert: "aW1wb3J0ZWQ=".to_string(),
            })),
            blobs: Arc::new(MemoryEncryptedStore::default()),
            host: Arc::new(ScriptedHost::new(HostOutcome::Succeed)),
            config,
            work,
        }
    }

    pub fn with_validator(mut self, validator: StaticValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_exchanger(mut self, exchanger: StaticExchanger) -> Self {
        self.exchanger = Arc::new(exchanger);
        self
    }

    pub fn with_host(mut self, host: ScriptedHost) -> Self {
        self.host = Arc::new(host);
        self
    }

    pub fn provisioner(&self) -> ClusterProvisioner {
        let registry = DriverRegistry::new().with(DRIVER_RKE, self.driver.clone());
        ClusterProvisioner::new(
            Arc::new(self.clusters.clone()),
            Arc::new(self.machines.clone()),
            DriverGateway::new(registry, Arc::new(StaticDialer::default())),
            self.validator.clone(),
            self.exchanger.clone(),
            ClusterSettings::from(&self.config),
        )
    }

    pub fn machine_controller(&self) -> MachineController {
        MachineController::new(
            Arc::new(self.machines.clone()),
            Arc::new(self.clusters.clone()),
            Arc::new(self.templates.clone()),
            self.host.clone(),
            self.blobs.clone(),
            MachineSettings::from(&self.config),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.provisioner(), self.machine_controller(), self.config.not_ready_requeue)
    }

    /// Seeds machines that already report node-configs for `cluster`.
    pub fn seed_ready(&self, cluster: &str, nodes: &[(&str, &[&str])]) {
        for (i, (name, roles)) in nodes.iter().enumerate() {
            let address = format!("10.0.0.{}", i + 1);
            self.machines.insert(ready_machine(cluster, name, roles, &address));
        }
    }
}
