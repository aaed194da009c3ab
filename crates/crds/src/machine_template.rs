//! MachineTemplate CRD
//!
//! Reusable host definition: which host-provisioning driver to run and the
//! driver's flags, keyed by the same `<driverName>Config` convention as
//! cluster engines.

use crate::schema::preserve_unknown_fields;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Host definition shared by machines.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "clusterforge.io",
    version = "v1alpha1",
    kind = "MachineTemplate",
    namespaced,
    shortname = "cftemplate"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Host-provisioning driver, e.g. "amazonec2"
    pub driver: String,

    /// Container engine install script URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_install_url: Option<String>,

    /// SSH user override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    /// Driver flags keyed by `<driver>Config`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub configs: BTreeMap<String, Value>,

    /// Labels applied to provisioned nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}
