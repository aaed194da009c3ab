//! Controller-specific error types.
//!
//! The variants encode how the dispatcher treats a failure:
//! [`ControllerError::NotReady`] is a forgettable "retry later" outcome,
//! everything else is recorded on the relevant condition and surfaced.

use crate::host::HostError;
use conditions::{StepError, StoreError};
use driver_gateway::{BlobStoreError, DialError, DriverError, ExchangeError, ValidationError};
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the provisioning controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// More external progress is needed; not a failure
    #[error("{message}")]
    NotReady {
        /// Short reason code
        reason: String,
        /// Human-readable message
        message: String,
    },

    /// Cluster driver call failed
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Spec selects a different driver than the one the cluster was built with
    #[error("driver change from {from} to {to} is not allowed")]
    DriverChange {
        /// Applied driver
        from: String,
        /// Requested driver
        to: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Provisioned endpoint failed live validation
    #[error("API validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Host provisioning produced no usable result
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// Status could not be written within the retry bound
    #[error("failed to persist status of {name} after {attempts} attempts: {message}")]
    StatusWriteExhausted {
        /// Resource name
        name: String,
        /// Attempts made
        attempts: u32,
        /// Last error
        message: String,
    },

    /// Driver teardown did not succeed within the retry bound
    #[error("failed to remove cluster {name} after {attempts} attempts: {message}")]
    TeardownFailed {
        /// Cluster name
        name: String,
        /// Attempts made
        attempts: u32,
        /// Last error
        message: String,
    },

    /// Machine is still a member of its cluster's applied spec
    #[error("machine {node} is still part of cluster {cluster}")]
    MachineInUse {
        /// Node reference
        node: String,
        /// Owning cluster
        cluster: String,
    },

    /// Resource store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Imported cluster credential exchange failed
    #[error("Credential exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    /// External host-provisioning command failed
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Encrypted store error
    #[error("Encrypted store error: {0}")]
    Blob(#[from] BlobStoreError),

    /// Node connector could not be saved
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Working directory error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Builds a not-ready outcome with the `Waiting` reason.
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::NotReady {
            reason: "Waiting".to_string(),
            message: message.into(),
        }
    }
}

impl StepError for ControllerError {
    fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    fn reason(&self) -> String {
        match self {
            Self::NotReady { reason, .. } => reason.clone(),
            Self::Driver(_) => "DriverError".to_string(),
            Self::DriverChange { .. } => "DriverChange".to_string(),
            Self::InvalidConfig(_) => "InvalidConfig".to_string(),
            Self::Validation(_) => "ValidationFailed".to_string(),
            Self::Provision(_) | Self::Host(_) => "ProvisioningFailed".to_string(),
            Self::StatusWriteExhausted { .. } => "StatusWriteFailed".to_string(),
            Self::TeardownFailed { .. } => "TeardownFailed".to_string(),
            Self::MachineInUse { .. } => "MachineInUse".to_string(),
            Self::Store(e) => e.reason(),
            _ => "Error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_ready_is_forgettable() {
        assert!(ControllerError::waiting("waiting for etcd").is_not_ready());
        assert!(!ControllerError::InvalidConfig("x".to_string()).is_not_ready());
        assert!(
            !ControllerError::MachineInUse {
                node: "c1:m1".to_string(),
                cluster: "c1".to_string()
            }
            .is_not_ready()
        );
    }

    #[test]
    fn test_reasons() {
        assert_eq!(ControllerError::waiting("x").reason(), "Waiting");
        let change = ControllerError::DriverChange {
            from: "a".to_string(),
            to: "b".to_string(),
        };
        assert_eq!(change.reason(), "DriverChange");
        assert_eq!(change.to_string(), "driver change from a to b is not allowed");
    }
}
