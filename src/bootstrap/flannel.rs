//! flannel CNI
//!
//! Pod networking over a VXLAN overlay. The network configuration is derived
//! from the pod CIDRs: the first IPv4 CIDR becomes `Network`, the first IPv6
//! CIDR becomes `IPv6Network`, so single-stack and dual-stack clusters are
//! both supported.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, Container, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext, ServiceAccount, Toleration,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::{json, Value};

use super::rbac::{cluster_role_binding, service_account};
use super::{
    config_map_volume, field_env, host_path_volume, labels, mount, parse_cidr, require_non_empty,
    strings, to_object, ManifestTemplate, RenderError, KUBE_SYSTEM,
};
use crate::resources::BootstrapManifestsConfigSpec;

const TEMPLATE: ManifestTemplate = ManifestTemplate::Flannel;
const NAME: &str = "flannel";
const CONFIG_MAP_NAME: &str = "kube-flannel-cfg";
const VXLAN_PORT: u16 = 4789;

const CNI_CONF: &str = r#"{
  "name": "cbr0",
  "cniVersion": "1.0.0",
  "plugins": [
    {
      "type": "flannel",
      "delegate": {
        "hairpinMode": true,
        "isDefaultGateway": true
      }
    },
    {
      "type": "portmap",
      "capabilities": {
        "portMappings": true
      }
    }
  ]
}
"#;

/// Build `net-conf.json` from the pod CIDRs
fn net_conf(pod_cidrs: &[String]) -> Result<Value, RenderError> {
    if pod_cidrs.is_empty() {
        return Err(RenderError::invalid_input(
            TEMPLATE.name(),
            "PodCIDRs",
            "at least one pod CIDR is required",
        ));
    }

    let mut ipv4 = None;
    let mut ipv6 = None;
    for cidr in pod_cidrs {
        let (addr, _) = parse_cidr(TEMPLATE, "PodCIDRs", cidr)?;
        let slot = if addr.is_ipv4() { &mut ipv4 } else { &mut ipv6 };
        slot.get_or_insert(cidr.as_str());
    }

    let mut conf = json!({
        "Backend": {
            "Type": "vxlan",
            "Port": VXLAN_PORT,
        },
    });
    match ipv4 {
        Some(network) => conf["Network"] = json!(network),
        None => conf["EnableIPv4"] = json!(false),
    }
    if let Some(network) = ipv6 {
        conf["IPv6Network"] = json!(network);
        conf["EnableIPv6"] = json!(true);
    }
    Ok(conf)
}

fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&["pods"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&["nodes"])),
                verbs: strings(&["get", "list", "watch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&["nodes/status"])),
                verbs: strings(&["patch"]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn config_map(net_conf: &Value) -> Result<ConfigMap, RenderError> {
    let net_conf = serde_json::to_string_pretty(net_conf).map_err(|e| {
        RenderError::Serialization {
            template: TEMPLATE.name().to_string(),
            message: e.to_string(),
        }
    })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(labels(&[("tier", "node"), ("app", NAME)])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("cni-conf.json".to_string(), CNI_CONF.to_string()),
            ("net-conf.json".to_string(), net_conf),
        ])),
        ..Default::default()
    })
}

fn daemon_set(config: &BootstrapManifestsConfigSpec) -> DaemonSet {
    let labels = labels(&[("tier", "node"), ("k8s-app", NAME)]);

    DaemonSet {
        metadata: ObjectMeta {
            name: Some("kube-flannel".to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
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
                    host_network: Some(true),
                    priority_class_name: Some("system-node-critical".to_string()),
                    service_account_name: Some(NAME.to_string()),
                    tolerations: Some(vec![Toleration {
                        effect: Some("NoSchedule".to_string()),
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    init_containers: Some(vec![
                        Container {
                            name: "install-cni".to_string(),
                            image: Some(config.flannel_cni_image.clone()),
                            command: Some(strings(&["/install-cni.sh"])),
                            volume_mounts: Some(vec![mount("cni-plugin", "/host/opt/cni/bin", false)]),
                            ..Default::default()
                        },
                        Container {
                            name: "install-config".to_string(),
                            image: Some(config.flannel_image.clone()),
                            command: Some(strings(&["cp"])),
                            args: Some(strings(&[
                                "-f",
                                "/etc/kube-flannel/cni-conf.json",
                                "/etc/cni/net.d/10-flannel.conflist",
                            ])),
                            volume_mounts: Some(vec![
                                mount("cni", "/etc/cni/net.d", false),
                                mount("flannel-cfg", "/etc/kube-flannel/", false),
                            ]),
                            ..Default::default()
                        },
                    ]),
                    containers: vec![Container {
                        name: "kube-flannel".to_string(),
                        image: Some(config.flannel_image.clone()),
                        command: Some(strings(&["/opt/bin/flanneld"])),
                        args: Some(strings(&["--ip-masq", "--kube-subnet-mgr"])),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("100m".to_string())),
                                ("memory".to_string(), Quantity("50Mi".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        security_context: Some(SecurityContext {
                            privileged: Some(false),
                            capabilities: Some(Capabilities {
                                add: Some(strings(&["NET_ADMIN", "NET_RAW"])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        env: Some(vec![
                            field_env("POD_NAME", "metadata.name"),
                            field_env("POD_NAMESPACE", "metadata.namespace"),
                        ]),
                        volume_mounts: Some(vec![
                            mount("run", "/run/flannel", false),
                            mount("flannel-cfg", "/etc/kube-flannel/", false),
                            mount("xtables-lock", "/run/xtables.lock", false),
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        host_path_volume("run", "/run/flannel", None),
                        host_path_volume("cni-plugin", "/opt/cni/bin", None),
                        host_path_volume("cni", "/etc/cni/net.d", None),
                        config_map_volume("flannel-cfg", CONFIG_MAP_NAME),
                        host_path_volume("xtables-lock", "/run/xtables.lock", Some("FileOrCreate")),
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
    require_non_empty(TEMPLATE, "FlannelImage", &config.flannel_image)?;
    require_non_empty(TEMPLATE, "FlannelCNIImage", &config.flannel_cni_image)?;
    let net_conf = net_conf(&config.pod_cidrs)?;

    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let binding = cluster_role_binding(NAME, NAME, vec![service_account(NAME, KUBE_SYSTEM)]);

    Ok(vec![
        to_object(TEMPLATE, &cluster_role())?,
        to_object(TEMPLATE, &binding)?,
        to_object(TEMPLATE, &account)?,
        to_object(TEMPLATE, &config_map(&net_conf)?)?,
        to_object(TEMPLATE, &daemon_set(config))?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::all_enabled;
    use rstest::rstest;

    fn rendered_net_conf(objects: &[Value]) -> Value {
        let raw = objects[3]["data"]["net-conf.json"].as_str().unwrap();
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_object_order() {
        let objects = render(&all_enabled()).unwrap();
        let kinds: Vec<&str> = objects.iter().map(|o| o["kind"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["ClusterRole", "ClusterRoleBinding", "ServiceAccount", "ConfigMap", "DaemonSet"]
        );
    }

    #[rstest]
    #[case::ipv4_only(&["10.244.0.0/16"], Some("10.244.0.0/16"), None)]
    #[case::ipv6_only(&["fd00:10:244::/56"], None, Some("fd00:10:244::/56"))]
    #[case::dual_stack(&["10.244.0.0/16", "fd00:10:244::/56"], Some("10.244.0.0/16"), Some("fd00:10:244::/56"))]
    fn test_net_conf_follows_pod_cidrs(
        #[case] cidrs: &[&str],
        #[case] ipv4: Option<&str>,
        #[case] ipv6: Option<&str>,
    ) {
        let mut config = all_enabled();
        config.pod_cidrs = strings(cidrs);

        let conf = rendered_net_conf(&render(&config).unwrap());
        assert_eq!(conf["Backend"]["Type"], "vxlan");
        assert_eq!(conf["Backend"]["Port"], 4789);
        assert_eq!(conf["Network"].as_str(), ipv4);
        assert_eq!(conf["IPv6Network"].as_str(), ipv6);
        assert_eq!(conf.get("EnableIPv6").is_some(), ipv6.is_some());
        if ipv4.is_none() {
            assert_eq!(conf["EnableIPv4"], false);
        }
    }

    #[test]
    fn test_invalid_cidr_is_a_render_error() {
        let mut config = all_enabled();
        config.pod_cidrs = strings(&["10.244.0.0"]);
        let err = render(&config).unwrap_err();
        assert!(err.to_string().contains("PodCIDRs"));

        config.pod_cidrs.clear();
        assert!(render(&config).is_err());
    }

    #[test]
    fn test_cni_installer_uses_cni_image() {
        let mut config = all_enabled();
        config.flannel_cni_image = "ghcr.io/flannel-io/flannel-cni-plugin:v1".into();

        let objects = render(&config).unwrap();
        let init = objects[4]
            .pointer("/spec/template/spec/initContainers/0/image")
            .unwrap();
        assert_eq!(init, "ghcr.io/flannel-io/flannel-cni-plugin:v1");
    }
}
