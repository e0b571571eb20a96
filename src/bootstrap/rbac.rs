//! Cluster role bindings for node bootstrap and CSR approval

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use super::token::BOOTSTRAPPERS_GROUP;
use super::{to_object, ManifestTemplate, RenderError, KUBE_SYSTEM};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub(crate) fn group(name: &str) -> Subject {
    Subject {
        kind: "Group".to_string(),
        name: name.to_string(),
        api_group: Some(RBAC_API_GROUP.to_string()),
        ..Default::default()
    }
}

pub(crate) fn service_account(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Bind `subjects` to the cluster role `role`
pub(crate) fn cluster_role_binding(
    name: &str,
    role: &str,
    subjects: Vec<Subject>,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(subjects),
    }
}

fn single(
    template: ManifestTemplate,
    binding: ClusterRoleBinding,
) -> Result<Vec<Value>, RenderError> {
    Ok(vec![to_object(template, &binding)?])
}

/// Let bootstrapping nodes submit CSRs
pub(super) fn csr_node_bootstrap() -> Result<Vec<Value>, RenderError> {
    single(
        ManifestTemplate::CsrNodeBootstrap,
        cluster_role_binding(
            "system-bootstrap-node-bootstrapper",
            "system:node-bootstrapper",
            vec![group(BOOTSTRAPPERS_GROUP)],
        ),
    )
}

/// Auto-approve client CSRs from bootstrapping nodes
pub(super) fn csr_approver_role_binding() -> Result<Vec<Value>, RenderError> {
    single(
        ManifestTemplate::CsrApproverRoleBinding,
        cluster_role_binding(
            "system-bootstrap-approve-node-client-csr",
            "system:certificates.k8s.io:certificatesigningrequests:nodeclient",
            vec![group(BOOTSTRAPPERS_GROUP)],
        ),
    )
}

/// Auto-approve client certificate renewals from joined nodes
pub(super) fn csr_renewal_role_binding() -> Result<Vec<Value>, RenderError> {
    single(
        ManifestTemplate::CsrRenewalRoleBinding,
        cluster_role_binding(
            "system-bootstrap-node-renewal",
            "system:certificates.k8s.io:certificatesigningrequests:selfnodeclient",
            vec![group("system:nodes")],
        ),
    )
}

pub(super) fn kube_system_sa_role_binding() -> Result<Vec<Value>, RenderError> {
    single(
        ManifestTemplate::KubeSystemSaRoleBinding,
        cluster_role_binding(
            "kube-system-sa-role-binding",
            "cluster-admin",
            vec![group(&format!("system:serviceaccounts:{KUBE_SYSTEM}"))],
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::node_bootstrap(csr_node_bootstrap(), "system:node-bootstrapper", BOOTSTRAPPERS_GROUP)]
    #[case::approver(
        csr_approver_role_binding(),
        "system:certificates.k8s.io:certificatesigningrequests:nodeclient",
        BOOTSTRAPPERS_GROUP
    )]
    #[case::renewal(
        csr_renewal_role_binding(),
        "system:certificates.k8s.io:certificatesigningrequests:selfnodeclient",
        "system:nodes"
    )]
    #[case::kube_system(
        kube_system_sa_role_binding(),
        "cluster-admin",
        "system:serviceaccounts:kube-system"
    )]
    fn test_binding_targets(
        #[case] rendered: Result<Vec<Value>, RenderError>,
        #[case] role: &str,
        #[case] subject: &str,
    ) {
        let objects = rendered.unwrap();
        assert_eq!(objects.len(), 1);

        let binding = &objects[0];
        assert_eq!(binding["kind"], "ClusterRoleBinding");
        assert_eq!(binding["roleRef"]["kind"], "ClusterRole");
        assert_eq!(binding["roleRef"]["name"], role);
        assert_eq!(binding["subjects"][0]["kind"], "Group");
        assert_eq!(binding["subjects"][0]["name"], subject);
    }
}
