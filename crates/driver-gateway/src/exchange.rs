//! Credential exchange for imported clusters.
//!
//! An imported cluster arrives with a user supplied kubeconfig. The
//! exchanger connects with it once, installs a management service account
//! bound to `cluster-admin`, and hands back that account's token so the
//! kubeconfig itself never has to be kept.

use crate::driver::ClusterInfo;
use crate::error::ExchangeError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

const NAMESPACE: &str = "kube-system";
const ACCOUNT: &str = "clusterforge-admin";
const BINDING: &str = "clusterforge-admin-binding";
const TOKEN_SECRET: &str = "clusterforge-admin-token";

/// Turns a kubeconfig into management credentials.
#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    async fn exchange(&self, kubeconfig: &str) -> Result<ClusterInfo, ExchangeError>;
}

/// [`CredentialExchanger`] that talks to the imported cluster directly.
#[derive(Debug, Clone)]
pub struct KubeconfigExchanger {
    token_polls: u32,
    token_pause: Duration,
}

impl Default for KubeconfigExchanger {
    fn default() -> Self {
        Self {
            token_polls: 30,
            token_pause: Duration::from_secs(1),
        }
    }
}

impl KubeconfigExchanger {
    /// Exchanger polling for the token `token_polls` times, `token_pause` apart.
    pub fn new(token_polls: u32, token_pause: Duration) -> Self {
        Self {
            token_polls: token_polls.max(1),
            token_pause,
        }
    }

    async fn wait_for_token(&self, secrets: &Api<Secret>) -> Result<(String, Option<String>), ExchangeError> {
        for poll in 1..=self.token_polls {
            if let Some(data) = secrets.get_opt(TOKEN_SECRET).await?.and_then(|s| s.data)
                && let Some(token) = data.get("token")
            {
                let ca = data.get("ca.crt").map(|ca| BASE64.encode(&ca.0));
                return Ok((String::from_utf8_lossy(&token.0).into_owned(), ca));
            }
            debug!(poll, "Service account token not issued yet");
            tokio::time::sleep(self.token_pause).await;
        }
        Err(ExchangeError::TokenTimeout(format!("{NAMESPACE}/{ACCOUNT}")))
    }
}

async fn create_if_missing<K>(api: &Api<K>, object: &K) -> Result<(), kube::Error>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e),
    }
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

#[async_trait]
impl CredentialExchanger for KubeconfigExchanger {
    async fn exchange(&self, kubeconfig: &str) -> Result<ClusterInfo, ExchangeError> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let api_endpoint = config.cluster_url.to_string().trim_end_matches('/').to_string();
        let client = Client::try_from(config)?;
        info!(endpoint = %api_endpoint, "Installing management service account on imported cluster");

        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), NAMESPACE);
        create_if_missing(
            &accounts,
            &ServiceAccount {
                metadata: meta(ACCOUNT, Some(NAMESPACE)),
                ..Default::default()
            },
        )
        .await?;

        let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
        create_if_missing(
            &bindings,
            &ClusterRoleBinding {
                metadata: meta(BINDING, None),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: "cluster-admin".to_string(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: ACCOUNT.to_string(),
                    namespace: Some(NAMESPACE.to_string()),
                    api_group: None,
                }]),
            },
        )
        .await?;

        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        let mut secret_meta = meta(TOKEN_SECRET, Some(NAMESPACE));
        secret_meta.annotations = Some(BTreeMap::from([(
            "kubernetes.io/service-account.name".to_string(),
            ACCOUNT.to_string(),
        )]));
        create_if_missing(
            &secrets,
            &Secret {
                metadata: secret_meta,
                type_: Some("kubernetes.io/service-account-token".to_string()),
                ..Default::default()
            },
        )
        .await?;

        let (service_account_token, ca_cert) = self.wait_for_token(&secrets).await?;
        Ok(ClusterInfo {
            api_endpoint,
            service_account_token,
            ca_cert: ca_cert.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unparseable_kubeconfig() {
        let err = KubeconfigExchanger::default().exchange("clusters: [").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Kubeconfig(_)));
    }
}
