use garde::Validate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const RESOURCE_TYPE_INGRESS: &str = "ingress";
pub const RESOURCE_TYPE_GATEWAY: &str = "gateway";

#[derive(
    CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default, Validate,
)]
#[kube(
    group = "approuting.kubernetes.azure.com",
    version = "v1alpha1",
    kind = "ExternalDNS",
    plural = "externaldnses",
    status = "ExternalDNSStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDNSSpec {
    #[garde(custom(is_uuid))]
    pub tenant_id: String,
    #[garde(length(min = 1, max = 7))]
    pub dns_zone_resource_ids: Vec<String>,
    #[garde(inner(custom(known_resource_types)))]
    pub resource_types: Option<Vec<String>>,
    #[garde(dive)]
    pub identity: ExternalDNSIdentity,
    #[garde(skip)]
    pub filters: Option<ExternalDNSFilters>,
}

#[derive(
    CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default, Validate,
)]
#[kube(
    group = "approuting.kubernetes.azure.com",
    version = "v1alpha1",
    kind = "ClusterExternalDNS",
    plural = "clusterexternaldnses",
    status = "ExternalDNSStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExternalDNSSpec {
    /// Namespace the derived workload is placed in.
    #[garde(length(min = 1))]
    pub resource_namespace: String,
    #[garde(custom(is_uuid))]
    pub tenant_id: String,
    #[garde(length(min = 1, max = 7))]
    pub dns_zone_resource_ids: Vec<String>,
    #[garde(inner(custom(known_resource_types)))]
    pub resource_types: Option<Vec<String>>,
    #[garde(dive)]
    pub identity: ExternalDNSIdentity,
    #[garde(skip)]
    pub filters: Option<ExternalDNSFilters>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDNSIdentity {
    /// Workload-identity service account the instance runs as.
    #[garde(length(min = 1))]
    pub service_account: String,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDNSFilters {
    pub gateway_label_selector: Option<String>,
    pub route_and_ingress_label_selector: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDNSStatus {
    pub conditions: Option<Vec<Condition>>,
    pub observed_generation: Option<i64>,
}

fn is_uuid(value: &str, _context: &()) -> garde::Result {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| garde::Error::new("tenantID must be a UUID"))
}

fn known_resource_types(value: &[String], _context: &()) -> garde::Result {
    for t in value {
        if t != RESOURCE_TYPE_INGRESS && t != RESOURCE_TYPE_GATEWAY {
            return Err(garde::Error::new(format!(
                "resourceTypes may only contain \"{RESOURCE_TYPE_INGRESS}\" and \"{RESOURCE_TYPE_GATEWAY}\", got \"{t}\""
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid_spec() -> ExternalDNSSpec {
        ExternalDNSSpec {
            tenant_id: "2c105d52-8af5-4f5e-9d24-5c5ea0cbcee7".to_string(),
            dns_zone_resource_ids: vec![
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/dnszones/a.com"
                    .to_string(),
            ],
            resource_types: Some(vec![RESOURCE_TYPE_INGRESS.to_string()]),
            identity: ExternalDNSIdentity {
                service_account: "external-dns-sa".to_string(),
            },
            filters: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn tenant_id_must_be_a_uuid() {
        let mut spec = valid_spec();
        spec.tenant_id = "not-a-uuid".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn zone_count_is_bounded() {
        let mut spec = valid_spec();
        spec.dns_zone_resource_ids = vec![];
        assert!(spec.validate().is_err());
        spec.dns_zone_resource_ids = (0..8).map(|i| format!("zone-{i}")).collect();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn unknown_resource_types_fail() {
        let mut spec = valid_spec();
        spec.resource_types = Some(vec!["service".to_string()]);
        assert!(spec.validate().is_err());
    }
}
