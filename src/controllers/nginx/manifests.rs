use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        autoscaling::v2::{
            CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
            MetricSpec, MetricTarget, ResourceMetricSource,
        },
        core::v1::{
            CSIVolumeSource, Capabilities, ConfigMap, Container, ContainerPort, EnvVar,
            EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort,
            ServiceSpec, Volume, VolumeMount,
        },
        policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
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
use kube::{api::ObjectMeta, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controllers::managed_labels;

pub const NGINX_CONTROLLER_CLASS_PREFIX: &str = "approuting.kubernetes.azure.com/nginx";
const CONTROLLER_IMAGE: &str = "registry.k8s.io/ingress-nginx/controller:v1.11.2";
const DEFAULT_BACKEND_IMAGE: &str = "registry.k8s.io/defaultbackend-amd64:1.5";
const METRICS_PORT: i32 = 10254;

pub const DEFAULT_MIN_REPLICAS: i32 = 2;
pub const DEFAULT_MAX_REPLICAS: i32 = 100;
pub const DEFAULT_TARGET_CPU: i32 = 80;

/// Derived resource name for a controller prefix and its collision count.
/// The count always participates so two inputs sharing a prefix can never
/// produce the same name once their counts differ.
pub fn derived_resource_name(prefix: &str, collision_count: i32) -> String {
    format!("{prefix}-{collision_count}")
}

/// Everything the translators need to materialise one ingress controller.
#[derive(Debug, Clone, PartialEq)]
pub struct NginxIngressConfig {
    /// Derived name shared by the workload objects.
    pub name: String,
    pub namespace: String,
    pub controller_class: String,
    pub ingress_class_name: String,
    pub service_annotations: BTreeMap<String, String>,
    /// `<namespace>/<name>` of the default TLS secret, when configured.
    pub default_ssl_certificate: Option<String>,
    /// SecretProviderClass to mount so the CSI driver materialises the
    /// default certificate secret.
    pub default_ssl_cert_spc: Option<String>,
    /// User-provided `<namespace>/<name>` backend; when unset the operator
    /// deploys its own.
    pub default_backend_service: Option<String>,
    pub force_ssl_redirect: bool,
    pub http_disabled: bool,
    pub custom_http_errors: Vec<i32>,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_cpu_utilization_percentage: i32,
    pub enable_service_monitor: bool,
}

impl NginxIngressConfig {
    pub fn default_backend_name(&self) -> String {
        format!("{}-default-backend", self.name)
    }

    fn effective_default_backend(&self) -> Option<String> {
        match &self.default_backend_service {
            Some(user) => Some(user.clone()),
            None => Some(format!("{}/{}", self.namespace, self.default_backend_name())),
        }
    }
}

pub struct NginxIngressResources {
    pub ingress_class: k8s_openapi::api::networking::v1::IngressClass,
    pub service_account: ServiceAccount,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub role: Role,
    pub role_binding: RoleBinding,
    pub configmap: ConfigMap,
    pub deployment: Deployment,
    pub service: Service,
    pub hpa: HorizontalPodAutoscaler,
    pub pdb: PodDisruptionBudget,
    pub default_backend_deployment: Option<Deployment>,
    pub default_backend_service: Option<Service>,
    pub service_monitor: Option<ServiceMonitor>,
}

pub fn nginx_ingress_resources(
    cfg: &NginxIngressConfig,
    owner: &OwnerReference,
) -> NginxIngressResources {
    let (default_backend_deployment, default_backend_service) =
        if cfg.default_backend_service.is_none() {
            let (d, s) = default_backend(cfg, owner);
            (Some(d), Some(s))
        } else {
            (None, None)
        };

    NginxIngressResources {
        ingress_class: ingress_class(cfg, owner),
        service_account: ServiceAccount {
            metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
            ..Default::default()
        },
        cluster_role: cluster_role(cfg, owner),
        cluster_role_binding: cluster_role_binding(cfg, owner),
        role: role(cfg, owner),
        role_binding: role_binding(cfg, owner),
        configmap: controller_configmap(cfg, owner),
        deployment: controller_deployment(cfg, owner),
        service: controller_service(cfg, owner),
        hpa: hpa(cfg, owner),
        pdb: pdb(cfg, owner),
        default_backend_deployment,
        default_backend_service,
        service_monitor: cfg
            .enable_service_monitor
            .then(|| service_monitor(cfg, owner)),
    }
}

fn ingress_class(
    cfg: &NginxIngressConfig,
    owner: &OwnerReference,
) -> k8s_openapi::api::networking::v1::IngressClass {
    k8s_openapi::api::networking::v1::IngressClass {
        metadata: metadata(cfg, &cfg.ingress_class_name, None, owner),
        spec: Some(k8s_openapi::api::networking::v1::IngressClassSpec {
            controller: Some(cfg.controller_class.clone()),
            ..Default::default()
        }),
    }
}

fn controller_configmap(cfg: &NginxIngressConfig, owner: &OwnerReference) -> ConfigMap {
    let mut data = BTreeMap::from([(
        "ssl-redirect".to_string(),
        cfg.force_ssl_redirect.to_string(),
    )]);
    if !cfg.custom_http_errors.is_empty() {
        data.insert(
            "custom-http-errors".to_string(),
            cfg.custom_http_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    ConfigMap {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        data: Some(data),
        ..Default::default()
    }
}

fn controller_deployment(cfg: &NginxIngressConfig, owner: &OwnerReference) -> Deployment {
    let mut args = vec![
        "/nginx-ingress-controller".to_string(),
        format!("--ingress-class={}", cfg.ingress_class_name),
        format!("--controller-class={}", cfg.controller_class),
        format!("--election-id={}", cfg.name),
        format!("--publish-service={}/{}", cfg.namespace, cfg.name),
        format!("--configmap={}/{}", cfg.namespace, cfg.name),
        format!("--http-port={}", 8080),
        format!("--https-port={}", 8443),
    ];
    if let Some(secret) = &cfg.default_ssl_certificate {
        args.push(format!("--default-ssl-certificate={secret}"));
    }
    if let Some(backend) = cfg.effective_default_backend() {
        args.push(format!("--default-backend-service={backend}"));
    }

    let mut ports = vec![ContainerPort {
        name: Some("metrics".to_string()),
        container_port: METRICS_PORT,
        ..Default::default()
    }];
    if !cfg.http_disabled {
        ports.push(ContainerPort {
            name: Some("http".to_string()),
            container_port: 8080,
            ..Default::default()
        });
    }
    ports.push(ContainerPort {
        name: Some("https".to_string()),
        container_port: 8443,
        ..Default::default()
    });

    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(METRICS_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        ..Default::default()
    };

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();
    if let Some(spc) = &cfg.default_ssl_cert_spc {
        // Mounting the provider class is what makes the CSI driver
        // materialise the secret the controller is pointed at.
        volumes.push(Volume {
            name: "keyvault".to_string(),
            csi: Some(CSIVolumeSource {
                driver: "secrets-store.csi.k8s.io".to_string(),
                read_only: Some(true),
                volume_attributes: Some(BTreeMap::from([(
                    "secretProviderClass".to_string(),
                    spc.clone(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "keyvault".to_string(),
            mount_path: "/mnt/keyvault".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Deployment {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        spec: Some(DeploymentSpec {
            revision_history_limit: Some(2),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&cfg.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels(&cfg.name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(cfg.name.clone()),
                    containers: vec![Container {
                        name: "controller".to_string(),
                        image: Some(CONTROLLER_IMAGE.to_string()),
                        args: Some(args),
                        env: Some(vec![
                            downward_env("POD_NAME", "metadata.name"),
                            downward_env("POD_NAMESPACE", "metadata.namespace"),
                        ]),
                        ports: Some(ports),
                        liveness_probe: Some(probe.clone()),
                        readiness_probe: Some(probe),
                        security_context: Some(SecurityContext {
                            run_as_user: Some(101),
                            allow_privilege_escalation: Some(false),
                            capabilities: Some(Capabilities {
                                drop: Some(vec!["ALL".to_string()]),
                                add: Some(vec!["NET_BIND_SERVICE".to_string()]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("500m".to_string())),
                                ("memory".to_string(), Quantity("127Mi".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
                        ..Default::default()
                    }],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
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

fn controller_service(cfg: &NginxIngressConfig, owner: &OwnerReference) -> Service {
    let mut meta = metadata(cfg, &cfg.name, Some(&cfg.namespace), owner);
    if !cfg.service_annotations.is_empty() {
        meta.annotations = Some(cfg.service_annotations.clone());
    }
    let mut ports = Vec::new();
    if !cfg.http_disabled {
        ports.push(ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(IntOrString::String("http".to_string())),
            ..Default::default()
        });
    }
    ports.push(ServicePort {
        name: Some("https".to_string()),
        port: 443,
        target_port: Some(IntOrString::String("https".to_string())),
        ..Default::default()
    });
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(selector_labels(&cfg.name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn hpa(cfg: &NginxIngressConfig, owner: &OwnerReference) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: cfg.name.clone(),
            },
            min_replicas: Some(cfg.min_replicas),
            max_replicas: cfg.max_replicas,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(cfg.target_cpu_utilization_percentage),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pdb(cfg: &NginxIngressConfig, owner: &OwnerReference) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&cfg.name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn default_backend(cfg: &NginxIngressConfig, owner: &OwnerReference) -> (Deployment, Service) {
    let name = cfg.default_backend_name();
    let deployment = Deployment {
        metadata: metadata(cfg, &name, Some(&cfg.namespace), owner),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "defaultbackend".to_string(),
                        image: Some(DEFAULT_BACKEND_IMAGE.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: 8080,
                            ..Default::default()
                        }]),
                        security_context: Some(SecurityContext {
                            run_as_non_root: Some(true),
                            run_as_user: Some(65534),
                            allow_privilege_escalation: Some(false),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let service = Service {
        metadata: metadata(cfg, &name, Some(&cfg.namespace), owner),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    (deployment, service)
}

fn cluster_role(cfg: &NginxIngressConfig, owner: &OwnerReference) -> ClusterRole {
    let get_list_watch = vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    ClusterRole {
        metadata: metadata(cfg, &format!("{}-{}", cfg.namespace, cfg.name), None, owner),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    ["configmaps", "endpoints", "nodes", "pods", "secrets", "namespaces", "services"]
                        .map(String::from)
                        .to_vec(),
                ),
                verbs: get_list_watch.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                resources: Some(vec!["endpointslices".to_string()]),
                verbs: get_list_watch.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["networking.k8s.io".to_string()]),
                resources: Some(vec!["ingresses".to_string(), "ingressclasses".to_string()]),
                verbs: get_list_watch,
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["networking.k8s.io".to_string()]),
                resources: Some(vec!["ingresses/status".to_string()]),
                verbs: vec!["update".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["events".to_string()]),
                verbs: vec!["create".to_string(), "patch".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn cluster_role_binding(cfg: &NginxIngressConfig, owner: &OwnerReference) -> ClusterRoleBinding {
    let name = format!("{}-{}", cfg.namespace, cfg.name);
    ClusterRoleBinding {
        metadata: metadata(cfg, &name, None, owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: cfg.name.clone(),
            namespace: Some(cfg.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn role(cfg: &NginxIngressConfig, owner: &OwnerReference) -> Role {
    Role {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["configmaps".to_string()]),
                verbs: vec!["get".to_string(), "create".to_string(), "update".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["coordination.k8s.io".to_string()]),
                resources: Some(vec!["leases".to_string()]),
                verbs: vec!["get".to_string(), "create".to_string(), "update".to_string()],
                ..Default::default()
            },
        ]),
    }
}

fn role_binding(cfg: &NginxIngressConfig, owner: &OwnerReference) -> RoleBinding {
    RoleBinding {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: cfg.name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: cfg.name.clone(),
            namespace: Some(cfg.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn service_monitor(cfg: &NginxIngressConfig, owner: &OwnerReference) -> ServiceMonitor {
    ServiceMonitor {
        metadata: metadata(cfg, &cfg.name, Some(&cfg.namespace), owner),
        spec: ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(&cfg.name)),
                ..Default::default()
            },
            endpoints: vec![ServiceMonitorEndpoint {
                port: Some("metrics".to_string()),
                interval: Some("30s".to_string()),
            }],
        },
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn metadata(
    cfg: &NginxIngressConfig,
    name: &str,
    namespace: Option<&str>,
    owner: &OwnerReference,
) -> ObjectMeta {
    let mut labels = managed_labels();
    labels.extend(selector_labels(&cfg.name));
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

/// Vendored subset of the prometheus-operator ServiceMonitor contract; the
/// operator only writes it, it never reads one back in anger.
#[derive(CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    plural = "servicemonitors",
    namespaced
)]
pub struct ServiceMonitorSpec {
    pub selector: LabelSelector,
    pub endpoints: Vec<ServiceMonitorEndpoint>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ServiceMonitorEndpoint {
    pub port: Option<String>,
    pub interval: Option<String>,
}
