//! Node connector resolution.
//!
//! Drivers reach member nodes through connectors resolved from a node
//! reference. The connection material (TLS client material or SSH
//! credentials) is kept in the encrypted store under [`node_key`].

use crate::error::{BlobStoreError, DialError};
use crate::store::EncryptedStore;
use async_trait::async_trait;
use crds::NodeRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How to reach one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Connector {
    /// Docker/agent endpoint secured with client certificates
    #[serde(rename_all = "camelCase")]
    Tls {
        address: String,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    },
    /// Plain SSH
    #[serde(rename_all = "camelCase")]
    Ssh {
        address: String,
        port: String,
        user: String,
        private_key: String,
    },
}

/// Resolves node references to connectors.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn resolve(&self, node: &NodeRef) -> Result<Connector, DialError>;
}

/// Store key holding the connection material of a node.
#[must_use]
pub fn node_key(node: &NodeRef) -> String {
    format!("node-{}-{}", node.namespace, node.name)
}

/// Saves the connector for a node.
pub async fn save_connector(store: &dyn EncryptedStore, node: &NodeRef, connector: &Connector) -> Result<(), DialError> {
    let blob = serde_json::to_vec(connector)?;
    store.put(&node_key(node), &blob).await?;
    Ok(())
}

/// Forgets the connector for a node.
pub async fn delete_connector(store: &dyn EncryptedStore, node: &NodeRef) -> Result<(), BlobStoreError> {
    store.delete(&node_key(node)).await
}

/// [`Dialer`] reading connection material from an [`EncryptedStore`].
#[derive(Clone)]
pub struct StoreDialer {
    store: Arc<dyn EncryptedStore>,
}

impl std::fmt::Debug for StoreDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDialer").finish_non_exhaustive()
    }
}

impl StoreDialer {
    /// Dialer reading connection material from `store`.
    pub fn new(store: Arc<dyn EncryptedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Dialer for StoreDialer {
    async fn resolve(&self, node: &NodeRef) -> Result<Connector, DialError> {
        let key = node_key(node);
        debug!(node = %node, key = %key, "Resolving node connector");
        let blob = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| DialError::NotFound(node.to_string()))?;
        Ok(serde_json::from_slice(&blob)?)
    }
}
