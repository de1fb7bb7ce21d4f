use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Vendored subset of the secret-store CSI driver's SecretProviderClass.
/// The operator writes these; the CSI driver consumes them.
#[derive(CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "secrets-store.csi.x-k8s.io",
    version = "v1",
    kind = "SecretProviderClass",
    plural = "secretproviderclasses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassSpec {
    pub provider: String,
    pub parameters: Option<BTreeMap<String, String>>,
    pub secret_objects: Option<Vec<SecretObject>>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretObject {
    pub secret_name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: Vec<SecretObjectData>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjectData {
    pub object_name: String,
    pub key: String,
}
