//! kube-proxy DaemonSet
//!
//! Runs on the host network on every node. The configured `ProxyArgs` are
//! appended to the container command verbatim and in order, so the last
//! configured argument is the last element of the command.

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::Value;

use super::kubeconfig::CONFIG_MAP_NAME;
use super::rbac::{cluster_role_binding, service_account};
use super::{
    config_map_volume, field_env, host_path_volume, labels, mount, require_non_empty, to_object,
    ManifestTemplate, RenderError, KUBE_SYSTEM,
};
use crate::resources::BootstrapManifestsConfigSpec;

const TEMPLATE: ManifestTemplate = ManifestTemplate::KubeProxy;
const NAME: &str = "kube-proxy";
const BINARY: &str = "/usr/local/bin/kube-proxy";

fn daemon_set(config: &BootstrapManifestsConfigSpec) -> DaemonSet {
    let labels = labels(&[("tier", "node"), ("k8s-app", NAME)]);

    let mut command = vec![BINARY.to_string()];
    command.extend(config.proxy_args.iter().cloned());

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: NAME.to_string(),
                        image: Some(config.proxy_image.clone()),
                        command: Some(command),
                        env: Some(vec![
                            field_env("NODE_NAME", "spec.nodeName"),
                            field_env("POD_IP", "status.podIP"),
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![
                            mount("ssl-certs-host", "/etc/ssl/certs", true),
                            mount("kubeconfig", "/etc/kubernetes", true),
                            mount("lib-modules", "/lib/modules", true),
                        ]),
                        ..Default::default()
                    }],
                    host_network: Some(true),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    service_account_name: Some(NAME.to_string()),
                    tolerations: Some(vec![
                        Toleration {
                            effect: Some("NoSchedule".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                        Toleration {
                            effect: Some("NoExecute".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                    ]),
                    volumes: Some(vec![
                        host_path_volume("ssl-certs-host", "/etc/ssl/certs", None),
                        config_map_volume("kubeconfig", CONFIG_MAP_NAME),
                        host_path_volume("lib-modules", "/lib/modules", None),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn render(config: &BootstrapManifestsConfigSpec) -> Result<Vec<Value>, RenderError> {
    require_non_empty(TEMPLATE, "ProxyImage", &config.proxy_image)?;

    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let binding = cluster_role_binding(
        NAME,
        "system:node-proxier",
        vec![service_account(NAME, KUBE_SYSTEM)],
    );

    Ok(vec![
        to_object(TEMPLATE, &daemon_set(config))?,
        to_object(TEMPLATE, &account)?,
        to_object(TEMPLATE, &binding)?,
    ])
}
