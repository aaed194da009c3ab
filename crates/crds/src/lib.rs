//! Clusterforge CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the cluster and machine
//! provisioning controllers.

pub mod cluster;
pub mod condition;
pub mod error;
pub mod machine;
pub mod machine_template;
pub mod node_ref;
pub mod schema;

pub use cluster::*;
pub use condition::*;
pub use error::CrdError;
pub use machine::*;
pub use machine_template::*;
pub use node_ref::NodeRef;
