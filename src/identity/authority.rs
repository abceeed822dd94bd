//! # Certificate Authority Client
//!
//! Control-plane calls that issue a device certificate.
//!
//! Two operations are used, each exactly once per issued identity:
//!
//! | Operation | HTTP | Result |
//! |-----------|------|--------|
//! | create keys and certificate | `POST /keys-and-certificate?setAsActive=true` | PEM certificate, key pair, ARN |
//! | attach policy | `PUT /target-policies/{policyName}` | none |

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IdentityConfig;
use crate::error::{Result, TelemetryError};

/// Freshly issued certificate material.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_id: String,
    pub certificate_arn: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_arn", &self.certificate_arn)
            .finish_non_exhaustive()
    }
}

/// Broker control-plane operations used during identity issuance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Create a new active key pair and certificate on the broker side.
    async fn create_keys_and_certificate(&self) -> Result<IssuedCertificate>;

    /// Attach a named authorization policy to a certificate.
    async fn attach_policy(&self, policy_name: &str, certificate_arn: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeysAndCertificateResponse {
    certificate_arn: String,
    certificate_id: String,
    certificate_pem: String,
    key_pair: KeyPair,
}

#[derive(Debug, Deserialize)]
struct KeyPair {
    #[serde(rename = "PrivateKey")]
    private_key: String,
}

#[derive(Debug, Serialize)]
struct AttachPolicyRequest<'a> {
    target: &'a str,
}

/// HTTP client for the broker control plane.
#[derive(Debug, Clone)]
pub struct HttpCertificateAuthority {
    client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpCertificateAuthority {
    /// `timeout` bounds both the connect and the full request, so a silent
    /// control plane fails issuance instead of stalling it.
    pub fn new(base_url: &str, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TelemetryError::Issuance(format!("Invalid control plane URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(TelemetryError::Issuance(format!(
                "Control plane URL {} cannot be used as a base",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Issuance(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }

    /// Build the client, reading the bearer token from the configured environment variable.
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let token = config
            .access_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self::new(&config.control_plane_url, token, config.request_timeout())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CertificateAuthority for HttpCertificateAuthority {
    async fn create_keys_and_certificate(&self) -> Result<IssuedCertificate> {
        let mut url = self.endpoint(&["keys-and-certificate"]);
        url.query_pairs_mut().append_pair("setAsActive", "true");
        debug!("Requesting new key pair and certificate from {}", url);

        let response = self
            .authorize(self.client.post(url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TelemetryError::Issuance(format!("Create certificate request failed: {}", e)))?;

        let body: CreateKeysAndCertificateResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::Issuance(format!("Malformed certificate response: {}", e)))?;

        info!("Certificate {} created", body.certificate_id);
        Ok(IssuedCertificate {
            certificate_id: body.certificate_id,
            certificate_arn: body.certificate_arn,
            certificate_pem: body.certificate_pem,
            private_key_pem: body.key_pair.private_key,
        })
    }

    async fn attach_policy(&self, policy_name: &str, certificate_arn: &str) -> Result<()> {
        let url = self.endpoint(&["target-policies", policy_name]);
        debug!("Attaching policy {} to {}", policy_name, certificate_arn);

        self.authorize(self.client.put(url))
            .json(&AttachPolicyRequest {
                target: certificate_arn,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TelemetryError::Issuance(format!("Attach policy {} failed: {}", policy_name, e)))?;

        info!("Policy {} attached to {}", policy_name, certificate_arn);
        Ok(())
    }
}
