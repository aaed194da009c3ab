//! Driver that shells out to an external cluster engine binary.
//!
//! Each cluster gets a working directory `<work_root>/cluster-<name>`. The
//! engine is invoked as `<binary> up --config cluster.json` (or `remove`) from
//! inside that directory and is expected to leave the cluster credentials in
//! `cluster.state.json`.

use crate::driver::{ClusterDriver, ClusterInfo};
use crate::error::{DialError, DriverError};
use crate::logstream::DriverContext;
use crate::dialer::Connector;
use crate::process::run_streaming;
use async_trait::async_trait;
use crds::{DriverSpec, NodeConfig, NodeRef};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const CONFIG_FILE: &str = "cluster.json";
const STATE_FILE: &str = "cluster.state.json";

/// Node entry handed to the engine binary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineNode<'a> {
    node_name: &'a str,
    address: String,
    #[serde(skip_serializing_if = "is_blank")]
    internal_address: &'a str,
    user: String,
    port: String,
    role: &'a [String],
    ssh_key: String,
    #[serde(skip_serializing_if = "is_blank")]
    hostname_override: &'a str,
    labels: &'a BTreeMap<String, String>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Debug, Serialize)]
struct EngineConfig<'a> {
    #[serde(rename = "clusterName")]
    cluster_name: &'a str,
    nodes: Vec<EngineNode<'a>>,
    #[serde(flatten)]
    config: BTreeMap<String, Value>,
}

/// [`ClusterDriver`] running an engine binary such as `rke`.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    binary: PathBuf,
    args: Vec<String>,
    work_root: PathBuf,
}

impl CommandDriver {
    /// Driver running `binary`, with per-cluster directories under `work_root`.
    pub fn new(binary: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            work_root: work_root.into(),
        }
    }

    /// Arguments placed before the verb, e.g. a wrapper script.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn cluster_dir(&self, name: &str) -> PathBuf {
        self.work_root.join(format!("cluster-{name}"))
    }

    /// Resolves every node's connector and writes the engine config.
    async fn write_config(&self, ctx: &DriverContext, dir: &Path, name: &str, spec: &DriverSpec) -> Result<(), DriverError> {
        let mut nodes = Vec::with_capacity(spec.nodes.len());
        for node in &spec.nodes {
            nodes.push(engine_node(ctx, node).await?);
        }

        let config = match &spec.config {
            Value::Object(map) => map.clone().into_iter().collect(),
            Value::Null => BTreeMap::new(),
            other => BTreeMap::from([("config".to_string(), other.clone())]),
        };
        let document = EngineConfig {
            cluster_name: name,
            nodes,
            config,
        };

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(CONFIG_FILE), serde_json::to_vec_pretty(&document)?).await?;
        debug!(cluster = %name, dir = %dir.display(), nodes = spec.nodes.len(), "Wrote engine config");
        Ok(())
    }

    async fn run(&self, ctx: &DriverContext, dir: &Path, verb: &str) -> Result<String, DriverError> {
        let mut command = Command::new(&self.binary);
        command.current_dir(dir).args(&self.args).arg(verb);
        if verb == "remove" {
            command.arg("--force");
        }
        command.arg("--config").arg(CONFIG_FILE);

        let logger = ctx.logger.clone();
        run_streaming(command, |line| logger.info(line), &ctx.cancel).await
    }

    async fn up(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        let dir = self.cluster_dir(name);
        self.write_config(ctx, &dir, name, spec).await?;
        ctx.logger.info(format!("Provisioning cluster [{name}]"));
        self.run(ctx, &dir, "up").await?;

        let state = match tokio::fs::read(dir.join(STATE_FILE)).await {
            Ok(state) => state,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DriverError::MissingState(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let info: ClusterInfo = serde_json::from_slice(&state)?;
        ctx.logger.info(format!("Cluster [{name}] provisioned"));
        Ok(info)
    }
}

async fn engine_node<'a>(ctx: &DriverContext, node: &'a NodeConfig) -> Result<EngineNode<'a>, DriverError> {
    let mut entry = EngineNode {
        node_name: &node.node_name,
        address: node.address.clone(),
        internal_address: &node.internal_address,
        user: node.user.clone(),
        port: node.port.clone(),
        role: &node.role,
        ssh_key: node.ssh_key.clone(),
        hostname_override: &node.hostname_override,
        labels: &node.labels,
    };

    let node_ref: NodeRef = node.node_name.parse()?;
    match ctx.dialer.resolve(&node_ref).await {
        Ok(Connector::Ssh {
            address,
            port,
            user,
            private_key,
        }) => {
            entry.address = address;
            entry.port = port;
            entry.user = user;
            entry.ssh_key = private_key;
        }
        Ok(Connector::Tls { address, .. }) => entry.address = address,
        // Custom nodes carry their credentials in the node config itself.
        Err(DialError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(entry)
}

#[async_trait]
impl ClusterDriver for CommandDriver {
    async fn create(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        if tokio::fs::try_exists(self.cluster_dir(name).join(STATE_FILE)).await? {
            return Err(DriverError::AlreadyExists);
        }
        match self.up(ctx, name, spec).await {
            Err(DriverError::Command { message, .. }) if message.contains("already exists") => Err(DriverError::AlreadyExists),
            other => other,
        }
    }

    async fn update(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        self.up(ctx, name, spec).await
    }

    async fn remove(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<(), DriverError> {
        let dir = self.cluster_dir(name);
        if !tokio::fs::try_exists(&dir).await? {
            info!(cluster = %name, "No engine state, nothing to remove");
            return Ok(());
        }
        self.write_config(ctx, &dir, name, spec).await?;
        ctx.logger.info(format!("Removing cluster [{name}]"));
        self.run(ctx, &dir, "remove").await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "command_test.rs"]
mod command_test;
