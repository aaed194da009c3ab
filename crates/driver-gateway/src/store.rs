//! Encrypted blob storage.
//!
//! The store is opaque to the controllers: a key maps to a byte blob.
//! [`SecretStore`] keeps each blob in its own Kubernetes Secret, relying on
//! the API server's encryption at rest.

use crate::error::BlobStoreError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// Key/blob storage for connection material and machine working state.
#[async_trait]
pub trait EncryptedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
}

const DATA_KEY: &str = "blob";
const FIELD_MANAGER: &str = "clusterforge";

/// [`EncryptedStore`] backed by Secrets in one namespace.
#[derive(Clone)]
pub struct SecretStore {
    api: Api<Secret>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Store keeping its secrets in `namespace`.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

/// Maps a store key onto a valid Secret name.
pub(crate) fn secret_name(key: &str) -> Result<String, BlobStoreError> {
    let name: String = key
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let name = name.trim_matches(|c| c == '-' || c == '.').to_string();
    if name.is_empty() || name.len() > 253 {
        return Err(BlobStoreError::InvalidKey(key.to_string()));
    }
    Ok(name)
}

#[async_trait]
impl EncryptedStore for SecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let name = secret_name(key)?;
        let secret = self.api.get_opt(&name).await?;
        Ok(secret.and_then(|s| s.data).and_then(|mut data| data.remove(DATA_KEY)).map(|b| b.0))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        let name = secret_name(key)?;
        debug!(secret = %name, bytes = data.len(), "Writing store blob");
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "labels": { "app.kubernetes.io/managed-by": FIELD_MANAGER }
            },
            "type": "Opaque",
            "data": { DATA_KEY: BASE64.encode(data) }
        });
        self.api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let name = secret_name(key)?;
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_name_sanitizes_keys() {
        assert_eq!(secret_name("node-c1-m1").unwrap(), "node-c1-m1");
        assert_eq!(secret_name("machine-state-C1_m:1").unwrap(), "machine-state-c1-m-1");
        assert!(secret_name("___").is_err());
    }
}
