//! In-cluster kubeconfig
//!
//! Host-network components (kube-proxy) mount this ConfigMap to reach the
//! API server with their service account token.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use super::{require_non_empty, to_object, ManifestTemplate, RenderError, KUBE_SYSTEM};
use crate::resources::BootstrapManifestsConfigSpec;

const TEMPLATE: ManifestTemplate = ManifestTemplate::KubeconfigInCluster;

/// Name of the ConfigMap other templates mount
pub(crate) const CONFIG_MAP_NAME: &str = "kubeconfig-in-cluster";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

fn kubeconfig(server: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: {server}
    certificate-authority: {SERVICE_ACCOUNT_DIR}/ca.crt
users:
- name: service-account
  user:
    tokenFile: {SERVICE_ACCOUNT_DIR}/token
contexts:
- name: local
  context:
    cluster: local
    user: service-account
current-context: local
"#
    )
}

pub(super) fn render(config: &BootstrapManifestsConfigSpec) -> Result<Vec<Value>, RenderError> {
    require_non_empty(TEMPLATE, "Server", &config.server)?;

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "kubeconfig".to_string(),
            kubeconfig(&config.server),
        )])),
        ..Default::default()
    };

    Ok(vec![to_object(TEMPLATE, &config_map)?])
}
