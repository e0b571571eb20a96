//! KubernetesRoot secret payload

use std::fmt;

use serde::{Deserialize, Serialize};

/// PEM-encoded certificate and private key pair
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAndKey {
    /// PEM certificate
    #[serde(rename = "crt")]
    pub certificate: String,
    /// PEM private key
    #[serde(rename = "key")]
    pub key: String,
}

impl fmt::Debug for CertificateAndKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAndKey")
            .field("certificate", &self.certificate)
            .field("key", &redacted(&self.key))
            .finish()
    }
}

/// Root credential material for the cluster
///
/// An empty spec is valid: templates render with empty token fields, and the
/// controller only requires the resource to exist.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesRootSpec {
    /// Cluster name
    pub name: String,

    /// External API server endpoint
    pub endpoint: String,

    /// Cluster DNS domain
    pub dns_domain: String,

    /// Extra subject alternative names for the API server certificate
    #[serde(rename = "certSANs")]
    pub cert_sans: Vec<String>,

    /// Cluster CA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<CertificateAndKey>,

    /// Service account signing key (PEM)
    pub service_account_key: String,

    /// Kubelet bootstrap token id (`[a-z0-9]{6}`)
    #[serde(rename = "bootstrapTokenID")]
    pub bootstrap_token_id: String,

    /// Kubelet bootstrap token secret (`[a-z0-9]{16}`)
    pub bootstrap_token_secret: String,
}

impl fmt::Debug for KubernetesRootSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't expose key material in debug output
        f.debug_struct("KubernetesRootSpec")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("dns_domain", &self.dns_domain)
            .field("cert_sans", &self.cert_sans)
            .field("ca", &self.ca)
            .field("service_account_key", &redacted(&self.service_account_key))
            .field("bootstrap_token_id", &self.bootstrap_token_id)
            .field("bootstrap_token_secret", &redacted(&self.bootstrap_token_secret))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}
