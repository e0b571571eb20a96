//! CoreDNS and the kube-dns Service

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction,
    KeyToPath, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecurityContext, Service,
    ServiceAccount, ServicePort, ServiceSpec, Toleration, Volume,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::Value;

use super::rbac::{cluster_role_binding, service_account};
use super::{
    labels, mount, parse_ip, require_non_empty, strings, to_object, ManifestTemplate, RenderError,
    KUBE_SYSTEM,
};
use crate::resources::BootstrapManifestsConfigSpec;

const NAME: &str = "coredns";
const ROLE_NAME: &str = "system:coredns";
const APP_LABEL: &str = "kube-dns";

fn corefile(cluster_domain: &str) -> String {
    format!(
        r#".:53 {{
    errors
    health {{
        lameduck 5s
    }}
    ready
    log . {{
        class error
    }}
    prometheus :9153

    kubernetes {cluster_domain} in-addr.arpa ip6.arpa {{
        pods insecure
        fallthrough in-addr.arpa ip6.arpa
        ttl 30
    }}
    forward . /etc/resolv.conf {{
        max_concurrent 1000
    }}
    cache 30
    loop
    reload
    loadbalance
}}
"#
    )
}

fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.to_string()),
            labels: Some(labels(&[("kubernetes.io/bootstrapping", "rbac-defaults")])),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&["endpoints", "services", "pods", "namespaces"])),
                verbs: strings(&["list", "watch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["discovery.k8s.io"])),
                resources: Some(strings(&["endpointslices"])),
                verbs: strings(&["list", "watch"]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn config_map(cluster_domain: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "Corefile".to_string(),
            corefile(cluster_domain),
        )])),
        ..Default::default()
    }
}

fn port(name: &str, port: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment(image: &str) -> Deployment {
    let labels = labels(&[("k8s-app", APP_LABEL)]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    service_account_name: Some(NAME.to_string()),
                    tolerations: Some(vec![
                        Toleration {
                            key: Some("CriticalAddonsOnly".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                        Toleration {
                            key: Some("node-role.kubernetes.io/control-plane".to_string()),
                            effect: Some("NoSchedule".to_string()),
                            ..Default::default()
                        },
                    ]),
                    containers: vec![Container {
                        name: NAME.to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(strings(&["-conf", "/etc/coredns/Corefile"])),
                        resources: Some(ResourceRequirements {
                            limits: Some(BTreeMap::from([(
                                "memory".to_string(),
                                Quantity("170Mi".to_string()),
                            )])),
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("100m".to_string())),
                                ("memory".to_string(), Quantity("70Mi".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![mount("config-volume", "/etc/coredns", true)]),
                        ports: Some(vec![
                            port("dns", 53, "UDP"),
                            port("dns-tcp", 53, "TCP"),
                            port("metrics", 9153, "TCP"),
                        ]),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            capabilities: Some(Capabilities {
                                add: Some(strings(&["NET_BIND_SERVICE"])),
                                drop: Some(strings(&["all"])),
                            }),
                            read_only_root_filesystem: Some(true),
                            ..Default::default()
                        }),
                        liveness_probe: Some(Probe {
                            initial_delay_seconds: Some(60),
                            timeout_seconds: Some(5),
                            success_threshold: Some(1),
                            failure_threshold: Some(5),
                            ..http_probe("/health", 8080)
                        }),
                        readiness_probe: Some(http_probe("/ready", 8181)),
                        ..Default::default()
                    }],
                    dns_policy: Some("Default".to_string()),
                    volumes: Some(vec![Volume {
                        name: "config-volume".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: NAME.to_string(),
                            items: Some(vec![KeyToPath {
                                key: "Corefile".to_string(),
                                path: "Corefile".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `11-core-dns`: RBAC, Corefile and Deployment
pub(super) fn render_deployment(
    config: &BootstrapManifestsConfigSpec,
) -> Result<Vec<Value>, RenderError> {
    const TEMPLATE: ManifestTemplate = ManifestTemplate::CoreDns;
    require_non_empty(TEMPLATE, "CoreDNSImage", &config.core_dns_image)?;
    require_non_empty(TEMPLATE, "ClusterDomain", &config.cluster_domain)?;

    let binding = cluster_role_binding(
        ROLE_NAME,
        ROLE_NAME,
        vec![service_account(NAME, KUBE_SYSTEM)],
    );
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(vec![
        to_object(TEMPLATE, &cluster_role())?,
        to_object(TEMPLATE, &binding)?,
        to_object(TEMPLATE, &account)?,
        to_object(TEMPLATE, &config_map(&config.cluster_domain))?,
        to_object(TEMPLATE, &deployment(&config.core_dns_image))?,
    ])
}

/// `11-core-dns-svc`: the kube-dns Service at the configured cluster IP
pub(super) fn render_service(
    config: &BootstrapManifestsConfigSpec,
) -> Result<Vec<Value>, RenderError> {
    const TEMPLATE: ManifestTemplate = ManifestTemplate::CoreDnsService;
    let ip = parse_ip(TEMPLATE, "DNSServiceIP", &config.dns_service_ip)?;
    let family = if ip.is_ipv4() { "IPv4" } else { "IPv6" };

    let service_port = |name: &str, port: i32, protocol: &str| ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };

    let service = Service {
        metadata: ObjectMeta {
            name: Some(APP_LABEL.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(labels(&[
                ("k8s-app", APP_LABEL),
                ("kubernetes.io/cluster-service", "true"),
                ("kubernetes.io/name", "CoreDNS"),
            ])),
            annotations: Some(labels(&[
                ("prometheus.io/port", "9153"),
                ("prometheus.io/scrape", "true"),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(&[("k8s-app", APP_LABEL)])),
            cluster_ip: Some(ip.to_string()),
            ip_families: Some(strings(&[family])),
            ports: Some(vec![
                service_port("dns", 53, "UDP"),
                service_port("dns-tcp", 53, "TCP"),
                service_port("metrics", 9153, "TCP"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(vec![to_object(TEMPLATE, &service)?])
}
