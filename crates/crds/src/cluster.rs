//! Cluster CRD
//!
//! Declares a Kubernetes cluster: its member nodes and the configuration of
//! the engine that provisions it. Engine configuration is keyed by the
//! `<driverName>Config` convention, e.g. `rancherKubernetesEngineConfig`.

use crate::condition::{Condition, Conditioned};
use crate::machine::NodeConfig;
use crate::schema::{optional_preserve_unknown_fields, preserve_unknown_fields};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Driver name of the self-hosted orchestration engine.
pub const DRIVER_RKE: &str = "rancherKubernetesEngine";

/// Driver name recorded for clusters created from an external kubeconfig.
pub const DRIVER_IMPORTED: &str = "imported";

/// Suffix of every engine configuration key.
pub const ENGINE_CONFIG_SUFFIX: &str = "Config";

/// Returns the engine configuration key for a driver name.
#[must_use]
pub fn engine_config_key(driver_name: &str) -> String {
    format!("{driver_name}{ENGINE_CONFIG_SUFFIX}")
}

/// Returns the driver name encoded in an engine configuration key.
#[must_use]
pub fn driver_for_key(key: &str) -> Option<&str> {
    key.strip_suffix(ENGINE_CONFIG_SUFFIX).filter(|name| !name.is_empty())
}

/// Desired state of a cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "clusterforge.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    shortname = "cfcluster",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".status.driver"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoint"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Human-facing name; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Cluster hosts the control plane itself and is never provisioned
    #[serde(default)]
    pub internal: bool,

    /// Present when the cluster already exists and is only imported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_config: Option<ImportedConfig>,

    /// Desired member nodes
    #[serde(default)]
    pub nodes: Vec<ClusterNodeSpec>,

    /// Engine configuration keyed by `<driverName>Config`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub engines: BTreeMap<String, Value>,
}

impl ClusterSpec {
    /// Whether the cluster is driven through an engine at all.
    #[must_use]
    pub fn needs_provisioning(&self) -> bool {
        !self.internal
    }
}

/// Kubeconfig of an externally created cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportedConfig {
    /// Raw kubeconfig YAML
    pub kubeconfig: String,
}

/// One desired member node of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeSpec {
    /// Hostname requested for the node; machines are matched on it
    pub hostname: String,

    /// Node runs etcd
    #[serde(default)]
    pub etcd: bool,

    /// Node runs the control plane
    #[serde(default)]
    pub control_plane: bool,

    /// Node runs workloads
    #[serde(default)]
    pub worker: bool,

    /// Machine template reference (`<namespace>:<name>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Connection info for an existing host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<crate::machine::CustomConfig>,

    /// Labels copied onto the machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations copied onto the machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Specification handed to a cluster driver.
///
/// Computed on every reconciliation from the cluster spec and the live
/// machine set; stored only as the cluster's applied (or failed) spec.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    /// Driver the spec targets
    pub driver_name: String,

    /// Engine configuration taken from `<driverName>Config`
    #[serde(default)]
    #[schemars(schema_with = "optional_preserve_unknown_fields")]
    pub config: Value,

    /// Aggregated node list, sorted by node name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeConfig>,
}

/// Observed state of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Last spec successfully submitted to the driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<DriverSpec>,

    /// Last spec the driver rejected; serialized as null when cleared
    #[serde(default)]
    pub failed_spec: Option<DriverSpec>,

    /// Kubernetes API endpoint of the provisioned cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,

    /// Bearer token of the management service account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_token: Option<String>,

    /// Base64 encoded CA certificate (PEM or DER)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,

    /// Active driver name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    /// Provisioning conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Conditioned for Cluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(ClusterStatus::default).conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_key_convention() {
        assert_eq!(engine_config_key(DRIVER_RKE), "rancherKubernetesEngineConfig");
        assert_eq!(driver_for_key("rancherKubernetesEngineConfig"), Some(DRIVER_RKE));
        assert_eq!(driver_for_key("googleKubernetesEngineConfig"), Some("googleKubernetesEngine"));
        assert_eq!(driver_for_key("Config"), None);
        assert_eq!(driver_for_key("nodes"), None);
    }

    #[test]
    fn test_cleared_failed_spec_serializes_as_null() {
        let status = ClusterStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("failedSpec").unwrap().is_null());
        assert!(json.get("appliedSpec").is_none());
    }

    #[test]
    fn test_engines_roundtrip_from_manifest() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "nodes": [{"hostname": "n1", "etcd": true, "controlPlane": true}],
            "engines": {"rancherKubernetesEngineConfig": {"kubernetesVersion": "v1.30.2"}}
        }))
        .unwrap();
        assert!(spec.needs_provisioning());
        assert!(spec.nodes[0].control_plane);
        assert_eq!(
            spec.engines["rancherKubernetesEngineConfig"]["kubernetesVersion"],
            "v1.30.2"
        );
    }
}
