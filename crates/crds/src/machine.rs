//! Machine CRD
//!
//! One member node of a cluster. Machines live in the namespace named after
//! their cluster and are either templated (provisioned through an external
//! host-provisioning command) or custom (an existing host reached over SSH).

use crate::condition::{Condition, Conditioned};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// etcd role name in a node-config
pub const ROLE_ETCD: &str = "etcd";
/// Control plane role name in a node-config
pub const ROLE_CONTROLPLANE: &str = "controlplane";
/// Worker role name in a node-config
pub const ROLE_WORKER: &str = "worker";

/// Desired state of a machine.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "clusterforge.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    shortname = "cfmachine"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Owning cluster
    pub cluster_name: String,

    /// Hostname requested for the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_hostname: Option<String>,

    /// Machine template reference (`<namespace>:<name>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,

    /// Connection info for an existing host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfig>,

    /// Node runs etcd
    #[serde(default)]
    pub etcd: bool,

    /// Node runs the control plane
    #[serde(default)]
    pub control_plane: bool,

    /// Node runs workloads
    #[serde(default)]
    pub worker: bool,
}

impl MachineSpec {
    /// Role names selected by the role flags, in stable order.
    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        let mut roles = Vec::new();
        if self.etcd {
            roles.push(ROLE_ETCD.to_string());
        }
        if self.control_plane {
            roles.push(ROLE_CONTROLPLANE.to_string());
        }
        if self.worker {
            roles.push(ROLE_WORKER.to_string());
        }
        roles
    }
}

/// SSH connection info for a pre-existing host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    /// Public address
    pub address: String,

    /// Private address, if different
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_address: Option<String>,

    /// SSH user (defaults to root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH port (defaults to 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// PEM encoded private key
    pub ssh_key: String,
}

/// Node-config record consumed by cluster drivers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// `<namespace>:<name>` of the machine
    #[serde(default)]
    pub node_name: String,

    /// Public address
    #[serde(default)]
    pub address: String,

    /// Private address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_address: String,

    /// SSH user
    #[serde(default)]
    pub user: String,

    /// SSH port
    #[serde(default)]
    pub port: String,

    /// Roles: etcd, controlplane, worker
    #[serde(default)]
    pub role: Vec<String>,

    /// PEM encoded private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key: String,

    /// Hostname the node registers with
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname_override: String,

    /// Node labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Whether the node carries the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role.iter().any(|r| r == role)
    }
}

/// Observed state of a machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Driver resolved from the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,

    /// JSON encoded driver configuration from the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_config: Option<String>,

    /// Container engine install script URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_install_url: Option<String>,

    /// SSH user used by the provisioned host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    /// Hostname the host was provisioned with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Derived node-config; written once per machine generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<NodeConfig>,

    /// Provisioning conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Conditioned for Machine {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(MachineStatus::default).conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_follow_flags() {
        let spec = MachineSpec {
            cluster_name: "c1".to_string(),
            etcd: true,
            worker: true,
            ..Default::default()
        };
        assert_eq!(spec.roles(), vec![ROLE_ETCD.to_string(), ROLE_WORKER.to_string()]);
        assert!(MachineSpec::default().roles().is_empty());
    }
}
