//! Bootstrap manifest catalogue and templates
//!
//! The catalogue is a fixed, ordered list of slots. Each slot pairs a
//! manifest id (`<priority>-<component>`) with a template and a predicate on
//! the [`BootstrapManifestsConfigSpec`] deciding whether the slot is part of
//! the desired set. Rendering a slot produces the ordered Kubernetes objects
//! that make up the Manifest's body.
//!
//! # Slots
//!
//! | Id | Enabled when |
//! |---|---|
//! | `00-kubelet-bootstrapping-token` | always |
//! | `01-csr-approver-role-binding` | always |
//! | `01-csr-node-bootstrap` | always |
//! | `01-csr-renewal-role-binding` | always |
//! | `02-kube-system-sa-role-binding` | always |
//! | `03-default-pod-security-policy` | `PodSecurityPolicyEnabled` |
//! | `05-flannel` | `FlannelEnabled` |
//! | `10-kube-proxy` | `ProxyEnabled` |
//! | `11-core-dns` | `CoreDNSEnabled` |
//! | `11-core-dns-svc` | `CoreDNSEnabled` |
//! | `11-kube-config-in-cluster` | always |
//!
//! Templates build typed `k8s_openapi` objects and convert them to JSON
//! values, so the rendered bodies always carry `apiVersion` and `kind`.

mod coredns;
mod flannel;
mod kube_proxy;
mod kubeconfig;
mod psp;
mod rbac;
mod token;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
    Volume, VolumeMount,
};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::resources::{BootstrapManifestsConfigSpec, KubernetesRootSpec, ManifestSpec};

/// Namespace the rendered workloads run in
pub(crate) const KUBE_SYSTEM: &str = "kube-system";

/// Template rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    /// A configuration or secret field is unusable for this template
    #[error("template {template}: invalid {field}: {message}")]
    InvalidInput {
        /// Template being rendered
        template: String,
        /// Offending input field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// A rendered object could not be converted to its structured form
    #[error("template {template}: failed to serialize object: {message}")]
    Serialization {
        /// Template being rendered
        template: String,
        /// Underlying serializer error
        message: String,
    },
}

impl RenderError {
    /// Create an invalid-input error naming the template and field
    pub fn invalid_input(
        template: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidInput {
            template: template.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Template for one catalogue slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManifestTemplate {
    /// Kubelet TLS bootstrap token Secret
    KubeletBootstrappingToken,
    /// Auto-approval of node client CSRs
    CsrApproverRoleBinding,
    /// Permission for bootstrapping nodes to create CSRs
    CsrNodeBootstrap,
    /// Auto-approval of node client certificate renewals
    CsrRenewalRoleBinding,
    /// cluster-admin for kube-system service accounts
    KubeSystemSaRoleBinding,
    /// Default privileged PodSecurityPolicy
    DefaultPodSecurityPolicy,
    /// flannel CNI
    Flannel,
    /// kube-proxy DaemonSet
    KubeProxy,
    /// CoreDNS Deployment and configuration
    CoreDns,
    /// kube-dns Service
    CoreDnsService,
    /// In-cluster kubeconfig ConfigMap
    KubeconfigInCluster,
}

impl ManifestTemplate {
    /// Template name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::KubeletBootstrappingToken => "kubelet-bootstrapping-token",
            Self::CsrApproverRoleBinding => "csr-approver-role-binding",
            Self::CsrNodeBootstrap => "csr-node-bootstrap",
            Self::CsrRenewalRoleBinding => "csr-renewal-role-binding",
            Self::KubeSystemSaRoleBinding => "kube-system-sa-role-binding",
            Self::DefaultPodSecurityPolicy => "default-pod-security-policy",
            Self::Flannel => "flannel",
            Self::KubeProxy => "kube-proxy",
            Self::CoreDns => "core-dns",
            Self::CoreDnsService => "core-dns-svc",
            Self::KubeconfigInCluster => "kube-config-in-cluster",
        }
    }
}

impl fmt::Display for ManifestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One catalogue entry
#[derive(Clone, Copy)]
pub struct Slot {
    /// Manifest id
    pub id: &'static str,
    /// Template rendering the manifest body
    pub template: ManifestTemplate,
    enabled: fn(&BootstrapManifestsConfigSpec) -> bool,
}

impl Slot {
    /// Whether this slot belongs to the desired set under `config`
    pub fn is_enabled(&self, config: &BootstrapManifestsConfigSpec) -> bool {
        (self.enabled)(config)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("template", &self.template)
            .finish()
    }
}

fn always(_: &BootstrapManifestsConfigSpec) -> bool {
    true
}

fn pod_security_policy_enabled(config: &BootstrapManifestsConfigSpec) -> bool {
    config.pod_security_policy_enabled
}

fn flannel_enabled(config: &BootstrapManifestsConfigSpec) -> bool {
    config.flannel_enabled
}

fn proxy_enabled(config: &BootstrapManifestsConfigSpec) -> bool {
    config.proxy_enabled
}

fn core_dns_enabled(config: &BootstrapManifestsConfigSpec) -> bool {
    config.core_dns_enabled
}

const CATALOGUE: &[Slot] = &[
    Slot {
        id: "00-kubelet-bootstrapping-token",
        template: ManifestTemplate::KubeletBootstrappingToken,
        enabled: always,
    },
    Slot {
        id: "01-csr-approver-role-binding",
        template: ManifestTemplate::CsrApproverRoleBinding,
        enabled: always,
    },
    Slot {
        id: "01-csr-node-bootstrap",
        template: ManifestTemplate::CsrNodeBootstrap,
        enabled: always,
    },
    Slot {
        id: "01-csr-renewal-role-binding",
        template: ManifestTemplate::CsrRenewalRoleBinding,
        enabled: always,
    },
    Slot {
        id: "02-kube-system-sa-role-binding",
        template: ManifestTemplate::KubeSystemSaRoleBinding,
        enabled: always,
    },
    Slot {
        id: "03-default-pod-security-policy",
        template: ManifestTemplate::DefaultPodSecurityPolicy,
        enabled: pod_security_policy_enabled,
    },
    Slot {
        id: "05-flannel",
        template: ManifestTemplate::Flannel,
        enabled: flannel_enabled,
    },
    Slot {
        id: "10-kube-proxy",
        template: ManifestTemplate::KubeProxy,
        enabled: proxy_enabled,
    },
    Slot {
        id: "11-core-dns",
        template: ManifestTemplate::CoreDns,
        enabled: core_dns_enabled,
    },
    Slot {
        id: "11-core-dns-svc",
        template: ManifestTemplate::CoreDnsService,
        enabled: core_dns_enabled,
    },
    Slot {
        id: "11-kube-config-in-cluster",
        template: ManifestTemplate::KubeconfigInCluster,
        enabled: always,
    },
];

/// The full catalogue, in order
pub fn catalogue() -> &'static [Slot] {
    CATALOGUE
}

/// Slots enabled under `config`, in catalogue order
pub fn enabled_slots(config: &BootstrapManifestsConfigSpec) -> impl Iterator<Item = &'static Slot> + '_ {
    CATALOGUE.iter().filter(move |slot| slot.is_enabled(config))
}

/// Template collaborator
///
/// Turns a slot template plus the current inputs into the ordered objects of
/// one manifest.
#[cfg_attr(test, automock)]
pub trait ManifestRenderer: Send + Sync {
    /// Render one template
    fn render(
        &self,
        template: ManifestTemplate,
        config: &BootstrapManifestsConfigSpec,
        secrets: &KubernetesRootSpec,
    ) -> Result<Vec<Value>, RenderError>;
}

/// Built-in templates
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultManifestRenderer;

impl ManifestRenderer for DefaultManifestRenderer {
    fn render(
        &self,
        template: ManifestTemplate,
        config: &BootstrapManifestsConfigSpec,
        secrets: &KubernetesRootSpec,
    ) -> Result<Vec<Value>, RenderError> {
        match template {
            ManifestTemplate::KubeletBootstrappingToken => token::render(secrets),
            ManifestTemplate::CsrApproverRoleBinding => rbac::csr_approver_role_binding(),
            ManifestTemplate::CsrNodeBootstrap => rbac::csr_node_bootstrap(),
            ManifestTemplate::CsrRenewalRoleBinding => rbac::csr_renewal_role_binding(),
            ManifestTemplate::KubeSystemSaRoleBinding => rbac::kube_system_sa_role_binding(),
            ManifestTemplate::DefaultPodSecurityPolicy => psp::render(),
            ManifestTemplate::Flannel => flannel::render(config),
            ManifestTemplate::KubeProxy => kube_proxy::render(config),
            ManifestTemplate::CoreDns => coredns::render_deployment(config),
            ManifestTemplate::CoreDnsService => coredns::render_service(config),
            ManifestTemplate::KubeconfigInCluster => kubeconfig::render(config),
        }
    }
}

/// A rendered member of the desired set
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredManifest {
    /// Manifest id
    pub id: &'static str,
    /// Rendered body
    pub spec: ManifestSpec,
}

/// Render every enabled slot, in catalogue order
pub fn render_desired(
    renderer: &dyn ManifestRenderer,
    config: &BootstrapManifestsConfigSpec,
    secrets: &KubernetesRootSpec,
) -> Result<Vec<DesiredManifest>, RenderError> {
    enabled_slots(config)
        .map(|slot| {
            let objects = renderer.render(slot.template, config, secrets)?;
            Ok(DesiredManifest {
                id: slot.id,
                spec: ManifestSpec::new(objects),
            })
        })
        .collect()
}

// =============================================================================
// Template helpers
// =============================================================================

/// Convert a typed object to its structured form
pub(crate) fn to_object<T: Serialize>(
    template: ManifestTemplate,
    object: &T,
) -> Result<Value, RenderError> {
    serde_json::to_value(object).map_err(|e| RenderError::Serialization {
        template: template.name().to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn require_non_empty(
    template: ManifestTemplate,
    field: &str,
    value: &str,
) -> Result<(), RenderError> {
    if value.trim().is_empty() {
        return Err(RenderError::invalid_input(
            template.name(),
            field,
            "must not be empty",
        ));
    }
    Ok(())
}

pub(crate) fn parse_ip(
    template: ManifestTemplate,
    field: &str,
    value: &str,
) -> Result<IpAddr, RenderError> {
    value.parse().map_err(|_| {
        RenderError::invalid_input(
            template.name(),
            field,
            format!("{value:?} is not an IP address"),
        )
    })
}

/// Parse `addr/prefix` and check the prefix fits the address family
pub(crate) fn parse_cidr(
    template: ManifestTemplate,
    field: &str,
    value: &str,
) -> Result<(IpAddr, u8), RenderError> {
    let invalid = || {
        RenderError::invalid_input(
            template.name(),
            field,
            format!("{value:?} is not a CIDR"),
        )
    };

    let (addr, prefix) = value.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Environment variable populated from a pod field
pub(crate) fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}

pub(crate) fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}
