use std::collections::BTreeMap;

use garde::Validate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Longest name the object itself may have; the derived names append the
/// collision count and still have to fit in 253 characters.
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_PREFIX_LEN: usize = 243;
pub const DEFAULT_CONTROLLER_NAME_PREFIX: &str = "nginx";

#[derive(
    CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default, Validate,
)]
#[kube(
    group = "approuting.kubernetes.azure.com",
    version = "v1alpha1",
    kind = "NginxIngressController",
    plural = "nginxingresscontrollers",
    shortname = "nic",
    status = "NginxIngressControllerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerSpec {
    /// Name of the IngressClass the controller claims. Defaults to the
    /// object's own name. Immutable after the first reconcile.
    #[garde(pattern(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$"), length(max = 253))]
    pub ingress_class_name: Option<String>,
    /// Prefix of the derived workload names. Defaults to `nginx`.
    /// Immutable after the first reconcile.
    #[garde(pattern(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$"), length(max = 243))]
    pub controller_name_prefix: Option<String>,
    #[garde(skip)]
    pub load_balancer_annotations: Option<BTreeMap<String, String>>,
    #[garde(skip)]
    pub default_ssl_certificate: Option<DefaultSSLCertificate>,
    /// User-provided backend in `<namespace>/<name>` form; when unset the
    /// operator deploys its own.
    #[garde(skip)]
    pub default_backend_service: Option<String>,
    #[garde(skip)]
    pub http_disabled: Option<bool>,
    #[garde(skip)]
    pub custom_http_errors: Option<Vec<i32>>,
    #[garde(dive)]
    pub scaling: Option<Scaling>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefaultSSLCertificate {
    pub key_vault_uri: Option<String>,
    pub secret: Option<SecretReference>,
    pub force_ssl_redirect: Option<bool>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[garde(range(min = 1))]
    pub min_replicas: Option<i32>,
    #[garde(range(min = 1))]
    pub max_replicas: Option<i32>,
    #[garde(range(min = 1, max = 100))]
    pub target_cpu_utilization_percentage: Option<i32>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerStatus {
    pub conditions: Option<Vec<Condition>>,
    pub controller_replicas: Option<i32>,
    pub controller_ready_replicas: Option<i32>,
    pub controller_available_replicas: Option<i32>,
    pub controller_unavailable_replicas: Option<i32>,
    pub collision_count: Option<i32>,
    pub managed_resource_refs: Option<Vec<ManagedObjectReference>>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObjectReference {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub api_group: Option<String>,
}

impl NginxIngressController {
    pub fn ingress_class_name(&self) -> String {
        self.spec
            .ingress_class_name
            .clone()
            .unwrap_or_else(|| kube::ResourceExt::name_any(self))
    }

    pub fn controller_name_prefix(&self) -> String {
        self.spec
            .controller_name_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTROLLER_NAME_PREFIX.to_string())
    }

    pub fn collision_count(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.collision_count)
            .unwrap_or(0)
    }

    pub fn keyvault_uri(&self) -> Option<&String> {
        self.spec
            .default_ssl_certificate
            .as_ref()
            .and_then(|c| c.key_vault_uri.as_ref())
    }
}
