//! Cluster provisioner.
//!
//! Turns a cluster spec into driver calls: creates one machine per desired
//! node, aggregates the machines' node-configs into a driver spec once
//! quorum is met, submits it through the [`DriverGateway`] and records the
//! resulting endpoint and credentials on the cluster status.

use crate::backoff::BackoffTracker;
use crate::config::ProvisionerConfig;
use crate::error::ControllerError;
use crate::reconciler::log_relay::LogRelay;
use crate::reconciler::nodes::reconcile_rke_nodes;
use crate::reconciler::{
    CLUSTER_MACHINES_CREATED, CLUSTER_PROVISIONED, CLUSTER_READY, CLUSTER_REMOVED, CLUSTER_UPDATED,
};
use conditions::{ConditionType, EntityStore, RetryPolicy, StepOutcome, StoreError, retry, retry_if};
use crds::{
    Cluster, ClusterNodeSpec, DRIVER_IMPORTED, DRIVER_RKE, DriverSpec, Machine, MachineSpec, driver_for_key,
};
use driver_gateway::{ApiValidator, ClusterInfo, CredentialExchanger, DriverError, DriverGateway, log_stream};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry bounds used by the provisioner.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    /// Bound on the optimistic-concurrency status loop
    pub status_write: RetryPolicy,
    /// Bound on driver removal attempts
    pub teardown: RetryPolicy,
    /// Tries per relayed driver log line
    pub log_relay_attempts: u32,
}

impl From<&ProvisionerConfig> for ClusterSettings {
    fn from(config: &ProvisionerConfig) -> Self {
        Self {
            status_write: config.status_write,
            teardown: config.teardown,
            log_relay_attempts: config.log_relay_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverCall {
    Create,
    Update,
    Remove,
}

/// Re-enqueues a machine's cluster once the machine has a node-config.
pub fn machine_changed(machine: Machine) -> Option<ObjectRef<Cluster>> {
    machine.status.as_ref()?.node_config.as_ref()?;
    Some(ObjectRef::new(&machine.spec.cluster_name))
}

/// Drives clusters through creation, convergence and teardown.
pub struct ClusterProvisioner {
    clusters: Arc<dyn EntityStore<Cluster>>,
    machines: Arc<dyn EntityStore<Machine>>,
    gateway: DriverGateway,
    validator: Arc<dyn ApiValidator>,
    exchanger: Arc<dyn CredentialExchanger>,
    failures: BackoffTracker,
    settings: ClusterSettings,
}

impl ClusterProvisioner {
    pub fn new(
        clusters: Arc<dyn EntityStore<Cluster>>,
        machines: Arc<dyn EntityStore<Machine>>,
        gateway: DriverGateway,
        validator: Arc<dyn ApiValidator>,
        exchanger: Arc<dyn CredentialExchanger>,
        settings: ClusterSettings,
    ) -> Self {
        Self {
            clusters,
            machines,
            gateway,
            validator,
            exchanger,
            failures: BackoffTracker::for_failed_specs(),
            settings,
        }
    }

    /// Provisions a new cluster.
    ///
    /// A not-ready outcome is returned as [`ControllerError::NotReady`] and
    /// leaves `Provisioned` Unknown.
    pub async fn create(&self, mut cluster: Cluster) -> Result<Cluster, ControllerError> {
        if !cluster.spec.needs_provisioning() || CLUSTER_PROVISIONED.is_true(&cluster) {
            return Ok(cluster);
        }
        info!("Provisioning Cluster {}", cluster.name_any());

        for condition in [CLUSTER_READY, CLUSTER_PROVISIONED] {
            if condition.get_status(&cluster).is_none() {
                condition.set_unknown(&mut cluster, "Waiting", "Waiting for API to be available");
            }
        }

        CLUSTER_PROVISIONED
            .do_until_true(self.clusters.as_ref(), cluster, |c| self.reconcile(c, true, CLUSTER_PROVISIONED))
            .await
            .into_result()
    }

    /// Converges an already provisioned cluster with its current spec.
    pub async fn updated(&self, cluster: Cluster) -> Result<Cluster, ControllerError> {
        if !cluster.spec.needs_provisioning() {
            return Ok(cluster);
        }
        if !CLUSTER_PROVISIONED.is_true(&cluster) {
            return self.create(cluster).await;
        }
        debug!("Updating Cluster {}", cluster.name_any());

        CLUSTER_UPDATED
            .do_(self.clusters.as_ref(), cluster, |c| self.reconcile(c, false, CLUSTER_UPDATED))
            .await
            .into_result()
    }

    /// Tears the cluster down through its driver.
    ///
    /// Returns the latest stored cluster. Exhausting the teardown bound is a
    /// hard failure.
    pub async fn remove(&self, cluster: Cluster) -> Result<Cluster, ControllerError> {
        if !cluster.spec.needs_provisioning() {
            return Ok(cluster);
        }
        let name = cluster.name_any();
        let Some(spec) = teardown_spec(&cluster) else {
            info!("Cluster {} was never provisioned, nothing to remove", name);
            self.failures.reset(&name);
            return Ok(cluster);
        };
        if spec.driver_name == DRIVER_IMPORTED {
            self.failures.reset(&name);
            return Ok(cluster);
        }
        info!("Removing Cluster {}", name);

        let title = display_name(&cluster);
        let cluster = CLUSTER_REMOVED
            .do_(self.clusters.as_ref(), cluster, |c| async {
                let result = self.teardown(&name, &title, &spec).await;
                StepOutcome { object: c, result }
            })
            .await
            .into_result()?;
        self.failures.reset(&name);

        match self.clusters.get(None, &name).await {
            Ok(latest) => Ok(latest),
            Err(StoreError::NotFound(_)) => Ok(cluster),
            Err(e) => Err(e.into()),
        }
    }

    /// The step shared by create and update.
    async fn reconcile(&self, cluster: Cluster, create: bool, condition: ConditionType) -> StepOutcome<Cluster, ControllerError> {
        if let Err(e) = machine_names(&cluster.spec.nodes) {
            return StepOutcome::err(cluster, e);
        }

        let StepOutcome { object: cluster, result } = CLUSTER_MACHINES_CREATED
            .once(self.clusters.as_ref(), cluster, |c| self.create_machines(c))
            .await;
        if let Err(e) = result {
            return StepOutcome::err(cluster, e);
        }

        if let Some(imported) = cluster.spec.imported_config.clone() {
            return self.import(cluster, &imported.kubeconfig).await;
        }

        let spec = match self.driver_spec(&cluster).await {
            Ok(spec) => spec,
            Err(e) => return StepOutcome::err(cluster, e),
        };

        let applied = cluster.status.as_ref().and_then(|s| s.applied_spec.as_ref());
        if applied == Some(&spec) {
            debug!("Cluster {} spec unchanged, nothing to apply", cluster.name_any());
            return StepOutcome::ok(cluster);
        }

        self.provision(cluster, spec, create, condition).await
    }

    /// Creates one machine per desired node that has none yet.
    async fn create_machines(&self, cluster: Cluster) -> StepOutcome<Cluster, ControllerError> {
        let name = cluster.name_any();
        let existing = match self.machines.list(Some(&name)).await {
            Ok(machines) => machines,
            Err(e) => return StepOutcome::err(cluster, e),
        };
        let hostnames: BTreeSet<String> = existing
            .iter()
            .map(|m| m.spec.requested_hostname.clone().unwrap_or_else(|| m.name_any()))
            .collect();

        for node in cluster.spec.nodes.iter().filter(|n| !hostnames.contains(&n.hostname)) {
            let machine = new_machine(&cluster, node);
            match self.machines.create(&machine).await {
                Ok(_) => info!("Created Machine {}/{} for Cluster {}", name, machine.name_any(), name),
                Err(StoreError::AlreadyExists(_)) => debug!("Machine {}/{} already exists", name, machine.name_any()),
                Err(e) => return StepOutcome::err(cluster, e),
            }
        }
        StepOutcome::ok(cluster)
    }

    /// Computes the driver spec for the cluster's current state.
    async fn driver_spec(&self, cluster: &Cluster) -> Result<DriverSpec, ControllerError> {
        let name = cluster.name_any();
        let mut engines = cluster
            .spec
            .engines
            .iter()
            .filter(|(_, config)| !config.is_null())
            .filter_map(|(key, config)| driver_for_key(key).map(|driver| (driver, config)));

        let Some((driver_name, config)) = engines.next() else {
            return Err(ControllerError::waiting("waiting for full cluster configuration"));
        };
        if let Some((other, _)) = engines.next() {
            return Err(ControllerError::InvalidConfig(format!(
                "cluster {name} configures more than one engine: {driver_name}, {other}"
            )));
        }

        if let Some(applied) = cluster.status.as_ref().and_then(|s| s.driver.as_deref())
            && !applied.is_empty()
            && applied != driver_name
        {
            return Err(ControllerError::DriverChange {
                from: applied.to_string(),
                to: driver_name.to_string(),
            });
        }

        let nodes = if driver_name == DRIVER_RKE {
            let machines = self.machines.list(Some(&name)).await?;
            reconcile_rke_nodes(&name, &machines)?
        } else {
            Vec::new()
        };

        Ok(DriverSpec {
            driver_name: driver_name.to_string(),
            config: config.clone(),
            nodes,
        })
    }

    /// Submits `spec` to the driver and records the result.
    async fn provision(
        &self,
        cluster: Cluster,
        spec: DriverSpec,
        create: bool,
        condition: ConditionType,
    ) -> StepOutcome<Cluster, ControllerError> {
        let name = cluster.name_any();

        if !self.gateway.registry().contains(&spec.driver_name) {
            return StepOutcome::err(cluster, DriverError::UnknownDriver(spec.driver_name));
        }

        let failed_before = cluster.status.as_ref().and_then(|s| s.failed_spec.as_ref()) == Some(&spec);
        if failed_before && let Some(wait) = self.failures.remaining(&name) {
            return StepOutcome::err(
                cluster,
                ControllerError::NotReady {
                    reason: "BackingOff".to_string(),
                    message: format!("backing off failure, retrying in {}s", wait.as_secs()),
                },
            );
        }

        // The driver is recorded before the first call so a partial create
        // can still be torn down.
        let recorded = cluster.status.as_ref().and_then(|s| s.driver.as_deref());
        let cluster = if recorded.is_none_or(str::is_empty) {
            let driver_name = spec.driver_name.clone();
            match self
                .update_status(&name, |c| {
                    c.status.get_or_insert_with(Default::default).driver = Some(driver_name.clone());
                })
                .await
            {
                Ok(saved) => saved,
                Err(e) => return StepOutcome::err(cluster, e),
            }
        } else {
            cluster
        };

        let title = display_name(&cluster);
        let call = if create { DriverCall::Create } else { DriverCall::Update };
        let info = match self.call_driver(&name, &title, condition, call, &spec).await {
            Ok(Some(info)) => info,
            Ok(None) => return self.record_failure(cluster, spec, DriverError::MissingState(name.clone()).into()).await,
            Err(e) => return self.record_failure(cluster, spec, e.into()).await,
        };

        if let Err(e) = self
            .validator
            .validate(&info.api_endpoint, &info.service_account_token, &info.ca_cert)
            .await
        {
            return self.record_failure(cluster, spec, e.into()).await;
        }

        match self.save_applied(&name, spec, info).await {
            Ok(saved) => {
                self.failures.reset(&name);
                info!("Cluster {} provisioned", name);
                StepOutcome::ok(saved)
            }
            Err(e) => StepOutcome::err(cluster, e),
        }
    }

    /// Derives credentials for an imported cluster from its kubeconfig.
    async fn import(&self, cluster: Cluster, kubeconfig: &str) -> StepOutcome<Cluster, ControllerError> {
        let name = cluster.name_any();
        let status = cluster.status.as_ref();
        match status.and_then(|s| s.driver.as_deref()) {
            Some(DRIVER_IMPORTED) if status.and_then(|s| s.api_endpoint.as_ref()).is_some() => {
                return StepOutcome::ok(cluster);
            }
            Some(other) if !other.is_empty() && other != DRIVER_IMPORTED => {
                let err = ControllerError::DriverChange {
                    from: other.to_string(),
                    to: DRIVER_IMPORTED.to_string(),
                };
                return StepOutcome::err(cluster, err);
            }
            _ => {}
        }

        info!("Importing Cluster {}", name);
        let info = match self.exchanger.exchange(kubeconfig).await {
            Ok(info) => info,
            Err(e) => return StepOutcome::err(cluster, e),
        };
        if let Err(e) = self
            .validator
            .validate(&info.api_endpoint, &info.service_account_token, &info.ca_cert)
            .await
        {
            return StepOutcome::err(cluster, e);
        }

        let spec = DriverSpec {
            driver_name: DRIVER_IMPORTED.to_string(),
            config: Value::Null,
            nodes: Vec::new(),
        };
        match self.save_applied(&name, spec, info).await {
            Ok(saved) => StepOutcome::ok(saved),
            Err(e) => StepOutcome::err(cluster, e),
        }
    }

    /// Runs one driver call with its log stream relayed onto `condition`.
    async fn call_driver(
        &self,
        name: &str,
        title: &str,
        condition: ConditionType,
        call: DriverCall,
        spec: &DriverSpec,
    ) -> Result<Option<ClusterInfo>, DriverError> {
        let (logger, events) = log_stream();
        let cancel = CancellationToken::new();
        let relay = LogRelay::new(Arc::clone(&self.clusters), name, condition, self.settings.log_relay_attempts)
            .spawn(events, cancel.clone());

        let result = {
            let _cancel_relay = cancel.clone().drop_guard();
            let ctx = self.gateway.context(logger, cancel.clone());
            match call {
                DriverCall::Create => self.gateway.create(&ctx, title, spec).await.map(Some),
                DriverCall::Update => self.gateway.update(&ctx, title, spec).await.map(Some),
                DriverCall::Remove => self.gateway.remove(&ctx, title, spec).await.map(|()| None),
            }
        };

        if let Err(e) = relay.await {
            warn!(cluster = %name, error = %e, "Driver log relay task failed");
        }
        result
    }

    async fn teardown(&self, name: &str, title: &str, spec: &DriverSpec) -> Result<(), ControllerError> {
        let policy = self.settings.teardown;
        retry(policy, "remove_cluster", |attempt| async move {
            debug!(cluster = %name, attempt, "Removing cluster through driver");
            self.call_driver(name, title, CLUSTER_REMOVED, DriverCall::Remove, spec)
                .await
                .map(|_| ())
        })
        .await
        .map_err(|e| ControllerError::TeardownFailed {
            name: name.to_string(),
            attempts: policy.attempts.max(1),
            message: e.to_string(),
        })
    }

    /// Records a rejected spec so the same spec is not resubmitted before
    /// its backoff elapses.
    async fn record_failure(
        &self,
        cluster: Cluster,
        spec: DriverSpec,
        error: ControllerError,
    ) -> StepOutcome<Cluster, ControllerError> {
        let name = cluster.name_any();
        let delay = self.failures.record_failure(&name);
        warn!(
            cluster = %name,
            error = %error,
            retry_in_secs = delay.as_secs(),
            "Driver rejected cluster spec"
        );

        match self
            .update_status(&name, |c| {
                c.status.get_or_insert_with(Default::default).failed_spec = Some(spec.clone());
            })
            .await
        {
            Ok(saved) => StepOutcome::err(saved, error),
            Err(write_err) => {
                warn!(cluster = %name, error = %write_err, "Failed to record failed spec");
                StepOutcome::err(cluster, error)
            }
        }
    }

    async fn save_applied(&self, name: &str, spec: DriverSpec, info: ClusterInfo) -> Result<Cluster, ControllerError> {
        self.update_status(name, |c| {
            let status = c.status.get_or_insert_with(Default::default);
            status.applied_spec = Some(spec.clone());
            status.failed_spec = None;
            status.api_endpoint = Some(info.api_endpoint.clone());
            status.service_account_token = Some(info.service_account_token.clone());
            status.ca_cert = Some(info.ca_cert.clone());
            status.driver = Some(spec.driver_name.clone());
            CLUSTER_READY.set_true(c);
        })
        .await
    }

    /// Read-modify-write of the cluster status, retried on conflict.
    async fn update_status<F>(&self, name: &str, mutate: F) -> Result<Cluster, ControllerError>
    where
        F: Fn(&mut Cluster),
    {
        let policy = self.settings.status_write;
        let mutate = &mutate;
        retry_if(policy, "update_cluster_status", StoreError::is_conflict, |_| async move {
            let mut latest = self.clusters.get(None, name).await?;
            mutate(&mut latest);
            self.clusters.replace_status(&latest).await
        })
        .await
        .map_err(|e| {
            if e.is_conflict() {
                ControllerError::StatusWriteExhausted {
                    name: name.to_string(),
                    attempts: policy.attempts.max(1),
                    message: e.to_string(),
                }
            } else {
                e.into()
            }
        })
    }
}

fn display_name(cluster: &Cluster) -> String {
    cluster
        .spec
        .display_name
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| cluster.name_any())
}

/// The spec to tear down with: the applied one, else the last one submitted.
///
/// `None` when no driver was ever called for the cluster.
fn teardown_spec(cluster: &Cluster) -> Option<DriverSpec> {
    let status = cluster.status.as_ref()?;
    let driver = status.driver.as_deref().filter(|d| !d.is_empty())?;
    if let Some(spec) = status.applied_spec.clone().or_else(|| status.failed_spec.clone()) {
        return Some(spec);
    }
    let config = cluster
        .spec
        .engines
        .iter()
        .find(|(key, _)| driver_for_key(key) == Some(driver))
        .map_or(Value::Null, |(_, config)| config.clone());
    Some(DriverSpec {
        driver_name: driver.to_string(),
        config,
        nodes: Vec::new(),
    })
}

/// Machine names for the desired nodes, rejecting hostnames that sanitize
/// to nothing or to the same name.
fn machine_names(nodes: &[ClusterNodeSpec]) -> Result<Vec<String>, ControllerError> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    let mut names = Vec::with_capacity(nodes.len());
    for node in nodes {
        let name = machine_name(&node.hostname);
        if name.is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "hostname {:?} does not yield a valid machine name",
                node.hostname
            )));
        }
        if let Some(other) = seen.insert(name.clone(), &node.hostname) {
            return Err(ControllerError::InvalidConfig(format!(
                "hostnames {:?} and {:?} both map to machine {}",
                other, node.hostname, name
            )));
        }
        names.push(name);
    }
    Ok(names)
}

/// Machine resource name for a requested hostname.
fn machine_name(hostname: &str) -> String {
    let name: String = hostname
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    name.trim_matches(|c| c == '-' || c == '.').to_string()
}

fn new_machine(cluster: &Cluster, node: &ClusterNodeSpec) -> Machine {
    let cluster_name = cluster.name_any();
    let metadata = ObjectMeta {
        name: Some(machine_name(&node.hostname)),
        namespace: Some(cluster_name.clone()),
        labels: (!node.labels.is_empty()).then(|| node.labels.clone()),
        annotations: (!node.annotations.is_empty()).then(|| node.annotations.clone()),
        owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };
    Machine {
        metadata,
        spec: MachineSpec {
            cluster_name,
            requested_hostname: Some(node.hostname.clone()),
            template_ref: node.template.clone(),
            custom_config: node.custom.clone(),
            etcd: node.etcd,
            control_plane: node.control_plane,
            worker: node.worker,
        },
        status: None,
    }
}

#[cfg(test)]
#[path = "cluster_test.rs"]
mod cluster_test;
