use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Capabilities, ConfigMap, ConfigMapVolumeSource, Container, HTTPGetAction, PodSpec,
            PodTemplateSpec, Probe, ResourceRequirements, SecurityContext, ServiceAccount, Volume,
            VolumeMount,
        },
        rbac::v1::{
            ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};

use super::zones::{DnsZoneConfig, ZoneKind};
use crate::{
    controllers::{managed_labels, FINALIZER},
    Result,
};

const EXTERNAL_DNS_IMAGE: &str = "registry.k8s.io/external-dns/external-dns:v0.15.0";
const CONFIG_VOLUME: &str = "azure-config";
const AZURE_CONFIG_KEY: &str = "azure.json";
const HEALTH_PORT: i32 = 7979;
pub const TXT_WILDCARD_REPLACEMENT: &str = "approutingwildcard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    Ingress,
    Gateway,
}

impl ResourceType {
    fn sources(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Ingress => &["ingress"],
            ResourceType::Gateway => &["gateway-httproute", "gateway-grpcroute"],
        }
    }
}

/// How the instance authenticates against the DNS zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    ManagedIdentity { client_id: String },
    WorkloadIdentity { service_account: String },
}

/// The desired deployment descriptor for one externalDNS instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalDnsConfig {
    pub tenant_id: String,
    pub cluster_uid: String,
    pub cloud: String,
    pub location: Option<String>,
    pub namespace: String,
    pub zones: DnsZoneConfig,
    pub resource_types: Vec<ResourceType>,
    pub identity: IdentityMode,
    pub sync_interval_seconds: u64,
    /// When true the instance only watches its own namespace and its RBAC
    /// is namespaced too.
    pub namespace_limited: bool,
    pub gateway_label_filter: Option<String>,
    pub route_and_ingress_label_filter: Option<String>,
}

impl ExternalDnsConfig {
    /// The fixed name all derived objects of this instance share.
    pub fn resource_name(&self) -> &'static str {
        match self.zones.kind {
            ZoneKind::Public => "external-dns",
            ZoneKind::Private => "external-dns-private",
        }
    }

    fn provider(&self) -> &'static str {
        match self.zones.kind {
            ZoneKind::Public => "azure",
            ZoneKind::Private => "azure-private-dns",
        }
    }

    fn service_account_name(&self) -> String {
        match &self.identity {
            IdentityMode::ManagedIdentity { .. } => self.resource_name().to_string(),
            IdentityMode::WorkloadIdentity { service_account } => service_account.clone(),
        }
    }
}

/// The derived object set for one instance. RBAC is namespaced or
/// cluster-wide depending on the instance scope; the service account only
/// exists in managed-identity mode (workload identity references a
/// user-authored one).
pub struct ExternalDnsResources {
    pub service_account: Option<ServiceAccount>,
    pub cluster_role: Option<ClusterRole>,
    pub cluster_role_binding: Option<ClusterRoleBinding>,
    pub role: Option<Role>,
    pub role_binding: Option<RoleBinding>,
    pub configmap: ConfigMap,
    pub deployment: Deployment,
}

pub fn external_dns_resources(
    cfg: &ExternalDnsConfig,
    owner: Option<&OwnerReference>,
) -> Result<ExternalDnsResources> {
    let config_json = azure_json(cfg)?;
    let service_account = match &cfg.identity {
        IdentityMode::ManagedIdentity { .. } => Some(ServiceAccount {
            metadata: metadata(cfg, cfg.resource_name(), Some(&cfg.namespace), owner),
            ..Default::default()
        }),
        IdentityMode::WorkloadIdentity { .. } => None,
    };

    let rules = rbac_rules(&cfg.resource_types);
    let subject = Subject {
        kind: "ServiceAccount".to_string(),
        name: cfg.service_account_name(),
        namespace: Some(cfg.namespace.clone()),
        ..Default::default()
    };
    let (cluster_role, cluster_role_binding, role, role_binding) = if cfg.namespace_limited {
        let role = Role {
            metadata: metadata(cfg, cfg.resource_name(), Some(&cfg.namespace), owner),
            rules: Some(rules),
        };
        let role_binding = RoleBinding {
            metadata: metadata(cfg, cfg.resource_name(), Some(&cfg.namespace), owner),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: cfg.resource_name().to_string(),
            },
            subjects: Some(vec![subject]),
        };
        (None, None, Some(role), Some(role_binding))
    } else {
        let name = format!("{}-{}", cfg.resource_name(), cfg.cluster_uid);
        let cluster_role = ClusterRole {
            metadata: metadata(cfg, &name, None, owner),
            rules: Some(rules),
            ..Default::default()
        };
        let cluster_role_binding = ClusterRoleBinding {
            metadata: metadata(cfg, &name, None, owner),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name,
            },
            subjects: Some(vec![subject]),
        };
        (Some(cluster_role), Some(cluster_role_binding), None, None)
    };

    let configmap = ConfigMap {
        metadata: metadata(cfg, cfg.resource_name(), Some(&cfg.namespace), owner),
        data: Some(BTreeMap::from([(
            AZURE_CONFIG_KEY.to_string(),
            config_json.clone(),
        )])),
        ..Default::default()
    };

    Ok(ExternalDnsResources {
        service_account,
        cluster_role,
        cluster_role_binding,
        role,
        role_binding,
        configmap,
        deployment: deployment(cfg, &config_json, owner),
    })
}

/// Contents of the `azure.json` provider configuration.
pub fn azure_json(cfg: &ExternalDnsConfig) -> Result<String> {
    let mut map = serde_json::Map::new();
    map.insert("tenantId".to_string(), cfg.tenant_id.clone().into());
    map.insert(
        "subscriptionId".to_string(),
        cfg.zones.subscription.clone().into(),
    );
    map.insert(
        "resourceGroup".to_string(),
        cfg.zones.resource_group.clone().into(),
    );
    map.insert("cloud".to_string(), cfg.cloud.clone().into());
    if let Some(location) = &cfg.location {
        map.insert("location".to_string(), location.clone().into());
    }
    match &cfg.identity {
        IdentityMode::ManagedIdentity { client_id } => {
            map.insert("useManagedIdentityExtension".to_string(), true.into());
            map.insert("userAssignedIdentityID".to_string(), client_id.clone().into());
        }
        IdentityMode::WorkloadIdentity { .. } => {
            map.insert("useWorkloadIdentityExtension".to_string(), true.into());
        }
    }
    Ok(serde_json::to_string(&serde_json::Value::Object(map))?)
}

/// First 16 hex characters of sha256 over the rendered configuration.
/// Stamped on the pod template so a ConfigMap change rolls the Deployment.
pub fn config_checksum(config_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn deployment(
    cfg: &ExternalDnsConfig,
    config_json: &str,
    owner: Option<&OwnerReference>,
) -> Deployment {
    let mut args = vec![
        format!("--provider={}", cfg.provider()),
        format!("--interval={}s", cfg.sync_interval_seconds),
        format!("--txt-owner-id={}", cfg.cluster_uid),
        format!("--txt-wildcard-replacement={TXT_WILDCARD_REPLACEMENT}"),
    ];
    args.extend(
        cfg.zones
            .zone_names
            .iter()
            .map(|z| format!("--domain-filter={z}")),
    );
    args.extend(
        cfg.resource_types
            .iter()
            .flat_map(|t| t.sources())
            .map(|s| format!("--source={s}")),
    );
    if cfg.namespace_limited {
        args.push(format!("--namespace={}", cfg.namespace));
    }
    if let Some(filter) = &cfg.route_and_ingress_label_filter {
        args.push(format!("--label-filter={filter}"));
    }
    if let Some(filter) = &cfg.gateway_label_filter {
        args.push(format!("--gateway-label-filter={filter}"));
    }

    let mut pod_labels = selector_labels(cfg);
    pod_labels.insert(
        "checksum/configmap".to_string(),
        config_checksum(config_json),
    );
    if matches!(cfg.identity, IdentityMode::WorkloadIdentity { .. }) {
        pod_labels.insert(
            "azure.workload.identity/use".to_string(),
            "true".to_string(),
        );
    }

    let quantities = BTreeMap::from([
        ("cpu".to_string(), Quantity("100m".to_string())),
        ("memory".to_string(), Quantity("250Mi".to_string())),
    ]);
    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        ..Default::default()
    };

    Deployment {
        metadata: metadata(cfg, cfg.resource_name(), Some(&cfg.namespace), owner),
        spec: Some(DeploymentSpec {
            // The upstream project does not support multiple replicas per
            // txt-owner; the cap is theirs, not ours.
            replicas: Some(1),
            revision_history_limit: Some(2),
            selector: LabelSelector {
                match_labels: Some(selector_labels(cfg)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(cfg.service_account_name()),
                    containers: vec![Container {
                        name: cfg.resource_name().to_string(),
                        image: Some(EXTERNAL_DNS_IMAGE.to_string()),
                        args: Some(args),
                        security_context: Some(SecurityContext {
                            run_as_non_root: Some(true),
                            run_as_user: Some(65532),
                            run_as_group: Some(65532),
                            read_only_root_filesystem: Some(true),
                            capabilities: Some(Capabilities {
                                drop: Some(vec!["ALL".to_string()]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        liveness_probe: Some(probe.clone()),
                        readiness_probe: Some(probe),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities.clone()),
                            limits: Some(quantities),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: CONFIG_VOLUME.to_string(),
                            mount_path: "/etc/kubernetes".to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: cfg.resource_name().to_string(),
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

fn rbac_rules(resource_types: &[ResourceType]) -> Vec<PolicyRule> {
    let mut rules = vec![
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![
                "endpoints".to_string(),
                "pods".to_string(),
                "services".to_string(),
                "configmaps".to_string(),
            ]),
            verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["nodes".to_string()]),
            verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
            ..Default::default()
        },
    ];
    if resource_types.contains(&ResourceType::Ingress) {
        rules.push(PolicyRule {
            api_groups: Some(vec![
                "extensions".to_string(),
                "networking.k8s.io".to_string(),
            ]),
            resources: Some(vec!["ingresses".to_string()]),
            verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
            ..Default::default()
        });
    }
    if resource_types.contains(&ResourceType::Gateway) {
        rules.push(PolicyRule {
            api_groups: Some(vec!["gateway.networking.k8s.io".to_string()]),
            resources: Some(vec![
                "gateways".to_string(),
                "httproutes".to_string(),
                "grpcroutes".to_string(),
            ]),
            verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
            ..Default::default()
        });
        rules.push(PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["namespaces".to_string()]),
            verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
            ..Default::default()
        });
    }
    rules
}

fn selector_labels(cfg: &ExternalDnsConfig) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), cfg.resource_name().to_string())])
}

fn metadata(
    cfg: &ExternalDnsConfig,
    name: &str,
    namespace: Option<&str>,
    owner: Option<&OwnerReference>,
) -> ObjectMeta {
    let mut labels = managed_labels();
    labels.extend(selector_labels(cfg));
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o.clone()]),
        // Enforcer-managed instances are not owned by anything; the
        // finalizer lets the enforcer notice and unblock deletions.
        finalizers: owner.is_none().then(|| vec![FINALIZER.to_string()]),
        ..Default::default()
    }
}
