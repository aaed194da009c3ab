//! Aggregation of ready machines into the orchestrator's node list.

use crate::error::ControllerError;
use crate::reconciler::MACHINE_PROVISIONED;
use crds::{ConditionStatus, Machine, NodeConfig, ROLE_CONTROLPLANE, ROLE_ETCD};
use kube::ResourceExt;

const DEFAULT_USER: &str = "root";
const DEFAULT_PORT: &str = "22";

/// Collects the node-configs of a cluster's usable machines.
///
/// Machines being deleted, belonging to another cluster, or without a
/// node-config yet are skipped. The result is sorted by node name and is
/// only returned when it holds at least one etcd and one control plane
/// node; anything less is reported as not ready.
pub fn reconcile_rke_nodes(cluster: &str, machines: &[Machine]) -> Result<Vec<NodeConfig>, ControllerError> {
    let mut nodes = Vec::new();
    let mut etcd = false;
    let mut control_plane = false;

    for machine in machines {
        if machine.metadata.deletion_timestamp.is_some() || machine.spec.cluster_name != cluster {
            continue;
        }

        let quorum_member = machine.spec.etcd || machine.spec.control_plane;
        if quorum_member && MACHINE_PROVISIONED.get_status(machine) == Some(ConditionStatus::Unknown) {
            let host = machine
                .spec
                .requested_hostname
                .clone()
                .unwrap_or_else(|| machine.name_any());
            return Err(ControllerError::waiting(format!("waiting for {host} to finish provisioning")));
        }

        let Some(mut node) = machine.status.as_ref().and_then(|s| s.node_config.clone()) else {
            continue;
        };
        if node.node_name.is_empty() {
            let namespace = machine.namespace().unwrap_or_else(|| cluster.to_string());
            node.node_name = format!("{namespace}:{}", machine.name_any());
        }
        if node.user.is_empty() {
            node.user = DEFAULT_USER.to_string();
        }
        if node.port.is_empty() {
            node.port = DEFAULT_PORT.to_string();
        }

        etcd |= node.has_role(ROLE_ETCD);
        control_plane |= node.has_role(ROLE_CONTROLPLANE);
        nodes.push(node);
    }

    if !etcd {
        return Err(ControllerError::waiting("waiting for etcd nodes"));
    }
    if !control_plane {
        return Err(ControllerError::waiting("waiting for controlplane nodes"));
    }

    nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    Ok(nodes)
}
