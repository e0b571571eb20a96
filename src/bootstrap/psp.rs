//! Default privileged PodSecurityPolicy
//!
//! `policy/v1beta1` PodSecurityPolicy has no typed counterpart in current
//! k8s-openapi releases, so the policy object itself is built as raw JSON.

use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

use super::rbac::{cluster_role_binding, group};
use super::{strings, to_object, ManifestTemplate, RenderError};

const TEMPLATE: ManifestTemplate = ManifestTemplate::DefaultPodSecurityPolicy;
const POLICY_NAME: &str = "privileged";
const ROLE_NAME: &str = "psp:privileged";

fn pod_security_policy() -> Value {
    json!({
        "apiVersion": "policy/v1beta1",
        "kind": "PodSecurityPolicy",
        "metadata": { "name": POLICY_NAME },
        "spec": {
            "fsGroup": { "rule": "RunAsAny" },
            "privileged": true,
            "runAsUser": { "rule": "RunAsAny" },
            "seLinux": { "rule": "RunAsAny" },
            "supplementalGroups": { "rule": "RunAsAny" },
            "volumes": ["*"],
            "allowedCapabilities": ["*"],
            "hostPID": true,
            "hostIPC": true,
            "hostNetwork": true,
            "hostPorts": [{ "min": 1, "max": 65535 }],
        },
    })
}

fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(strings(&["policy"])),
            resources: Some(strings(&["podsecuritypolicies"])),
            resource_names: Some(strings(&[POLICY_NAME])),
            verbs: strings(&["use"]),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub(super) fn render() -> Result<Vec<Value>, RenderError> {
    let binding = cluster_role_binding(
        ROLE_NAME,
        ROLE_NAME,
        vec![group("system:serviceaccounts"), group("system:nodes")],
    );

    Ok(vec![
        pod_security_policy(),
        to_object(TEMPLATE, &cluster_role())?,
        to_object(TEMPLATE, &binding)?,
    ])
}
