//! BootstrapManifestsConfig payload

use serde::{Deserialize, Serialize};

/// Desired-state input for the manifest controller
///
/// Field names on the wire are PascalCase, as operators write them
/// (`Server`, `PodCIDRs`, `DNSServiceIP`, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapManifestsConfigSpec {
    /// API server endpoint used by in-cluster kubeconfigs
    #[serde(rename = "Server")]
    pub server: String,

    /// Cluster DNS domain served by CoreDNS
    #[serde(rename = "ClusterDomain")]
    pub cluster_domain: String,

    /// Pod network CIDRs (IPv4 and/or IPv6)
    #[serde(rename = "PodCIDRs")]
    pub pod_cidrs: Vec<String>,

    /// Deploy kube-proxy
    #[serde(rename = "ProxyEnabled")]
    pub proxy_enabled: bool,

    /// kube-proxy image reference
    #[serde(rename = "ProxyImage")]
    pub proxy_image: String,

    /// kube-proxy command-line arguments, appended verbatim in order
    #[serde(rename = "ProxyArgs")]
    pub proxy_args: Vec<String>,

    /// Deploy CoreDNS
    #[serde(rename = "CoreDNSEnabled")]
    pub core_dns_enabled: bool,

    /// CoreDNS image reference
    #[serde(rename = "CoreDNSImage")]
    pub core_dns_image: String,

    /// ClusterIP of the kube-dns service
    #[serde(rename = "DNSServiceIP")]
    pub dns_service_ip: String,

    /// Deploy flannel CNI
    #[serde(rename = "FlannelEnabled")]
    pub flannel_enabled: bool,

    /// flannel daemon image reference
    #[serde(rename = "FlannelImage")]
    pub flannel_image: String,

    /// flannel CNI plugin installer image reference
    #[serde(rename = "FlannelCNIImage")]
    pub flannel_cni_image: String,

    /// Install the default privileged PodSecurityPolicy
    #[serde(rename = "PodSecurityPolicyEnabled")]
    pub pod_security_policy_enabled: bool,
}
