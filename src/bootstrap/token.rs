//! Kubelet TLS bootstrap token
//!
//! Nodes join with a bootstrap token; the Secret below is what the API
//! server authenticates it against. Rotating the id or secret in the
//! KubernetesRoot resource re-renders this manifest.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use super::{labels, to_object, ManifestTemplate, RenderError, KUBE_SYSTEM};
use crate::resources::KubernetesRootSpec;

/// Group bootstrapping nodes are placed in
pub(crate) const BOOTSTRAPPERS_GROUP: &str = "system:bootstrappers:nodes";

pub(super) fn render(secrets: &KubernetesRootSpec) -> Result<Vec<Value>, RenderError> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(format!("bootstrap-token-{}", secrets.bootstrap_token_id)),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        type_: Some("bootstrap.kubernetes.io/token".to_string()),
        string_data: Some(labels(&[
            ("token-id", secrets.bootstrap_token_id.as_str()),
            ("token-secret", secrets.bootstrap_token_secret.as_str()),
            ("usage-bootstrap-authentication", "true"),
            ("auth-extra-groups", BOOTSTRAPPERS_GROUP),
        ])),
        ..Default::default()
    };

    Ok(vec![to_object(
        ManifestTemplate::KubeletBootstrappingToken,
        &secret,
    )?])
}
