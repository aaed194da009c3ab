//! `<namespace>:<name>` references between resources.

use crate::error::CrdError;
use std::fmt;
use std::str::FromStr;

/// Reference to a namespaced resource written as `<namespace>:<name>`.
///
/// Used for machine templates and for the `nodeName` of a node-config,
/// which the driver dialer resolves back to stored connection material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    /// Namespace of the referenced resource
    pub namespace: String,
    /// Name of the referenced resource
    pub name: String,
}

impl NodeRef {
    /// Builds a reference from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for NodeRef {
    type Err = CrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains(':') => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(CrdError::InvalidReference(s.to_string())),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}
