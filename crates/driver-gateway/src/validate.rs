//! Live validation of freshly provisioned API endpoints.

use crate::error::ValidationError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::Duration;
use tracing::debug;

/// Confirms that an endpoint answers discovery with the given credentials.
#[async_trait]
pub trait ApiValidator: Send + Sync {
    async fn validate(&self, endpoint: &str, token: &str, ca_cert: &str) -> Result<(), ValidationError>;
}

/// [`ApiValidator`] issuing `GET <endpoint>/version` with a bearer token,
/// trusting the cluster's own CA.
#[derive(Debug, Clone)]
pub struct DiscoveryValidator {
    timeout: Duration,
}

impl Default for DiscoveryValidator {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl DiscoveryValidator {
    /// Validator giving up on an endpoint after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, ca_cert: &str) -> Result<reqwest::Client, ValidationError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if !ca_cert.is_empty() {
            let raw = BASE64.decode(ca_cert.trim())?;
            let cert = if raw.starts_with(b"-----BEGIN") {
                reqwest::Certificate::from_pem(&raw)?
            } else {
                reqwest::Certificate::from_der(&raw)?
            };
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl ApiValidator for DiscoveryValidator {
    async fn validate(&self, endpoint: &str, token: &str, ca_cert: &str) -> Result<(), ValidationError> {
        let endpoint = endpoint.trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }
        let client = self.client(ca_cert)?;
        let url = format!("{endpoint}/version");
        debug!(url = %url, "Validating cluster API endpoint");

        let response = client.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(ValidationError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_endpoint_is_rejected() {
        let err = DiscoveryValidator::default().validate("", "token", "").await.unwrap_err();
        assert!(matches!(err, ValidationError::EmptyEndpoint));
    }

    #[tokio::test]
    async fn test_ca_must_be_base64() {
        let err = DiscoveryValidator::default()
            .validate("https://10.0.0.1:6443", "token", "not base64!")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Encoding(_)));
    }
}
