//! CRD helper errors

use thiserror::Error;

/// Errors raised while interpreting CRD contents
#[derive(Debug, Error)]
pub enum CrdError {
    /// Reference is not of the form `<namespace>:<name>`
    #[error("invalid reference {0:?}, expected <namespace>:<name>")]
    InvalidReference(String),

    /// Engine configuration could not be encoded or decoded
    #[error("invalid engine configuration: {0}")]
    Serialization(#[from] serde_json::Error),
}
