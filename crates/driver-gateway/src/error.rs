//! Driver gateway errors

use thiserror::Error;

/// Errors returned by cluster drivers
#[derive(Debug, Error)]
pub enum DriverError {
    /// The cluster already exists; callers fall back to update
    #[error("cluster already exists")]
    AlreadyExists,

    /// No driver registered under this name
    #[error("no driver registered for {0:?}")]
    UnknownDriver(String),

    /// External command exited unsuccessfully
    #[error("{command} failed: {message}")]
    Command {
        /// Command line that failed
        command: String,
        /// Tail of its output
        message: String,
    },

    /// The driver call was cancelled before completion
    #[error("driver call cancelled")]
    Cancelled,

    /// Driver finished without reporting cluster credentials
    #[error("driver produced no cluster state: {0}")]
    MissingState(String),

    /// Filesystem or process error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Node connection material could not be resolved
    #[error("dial error: {0}")]
    Dial(#[from] DialError),

    /// Node reference was malformed
    #[error("invalid node reference: {0}")]
    Reference(#[from] crds::CrdError),
}

/// Errors raised while resolving a node connector
#[derive(Debug, Error)]
pub enum DialError {
    /// Nothing stored for the node
    #[error("no connection material stored for node {0}")]
    NotFound(String),

    /// Store access failed
    #[error("store error: {0}")]
    Store(#[from] BlobStoreError),

    /// Stored material could not be decoded
    #[error("invalid connection material: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from the encrypted blob store
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Key cannot be mapped to a storage object name
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
}

/// Errors from live API validation
#[derive(Debug, Error)]
pub enum ValidationError {
    /// CA certificate is not valid base64
    #[error("CA certificate is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Discovery endpoint answered with a failure status
    #[error("discovery against {endpoint} returned {status}")]
    Status {
        /// Endpoint that was probed
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// Endpoint is empty
    #[error("driver returned an empty API endpoint")]
    EmptyEndpoint,
}

/// Errors from exchanging an imported kubeconfig for credentials
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Kubeconfig could not be parsed or loaded
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Kubernetes API error against the imported cluster
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Token was not issued in time
    #[error("service account token for {0} was not issued")]
    TokenTimeout(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
