use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{Api, CustomResource, ResourceExt as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    uri::parse_keyvault_cert_uri, SpcOptions, SpcTranslator, TranslatorCtx,
    TLS_CERT_KV_URI_OPTION, TLS_CERT_SERVICE_ACCOUNT_OPTION, WI_CLIENT_ID_ANNOTATION,
};
use crate::{
    controllers::name::ControllerName,
    error::UserError,
    {Error, Result},
};

const MANAGED_GATEWAY_CLASS: &str = "istio";

/// Vendored partial Gateway API types. Unmodelled fields round-trip through
/// the flattened map so writing the object back never drops them.
#[derive(CustomResource, Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    plural = "gateways",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<Listener>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTls>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_refs: Option<Vec<SecretObjectReference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

pub fn listener_spc_name(gateway: &str, listener: &str) -> String {
    format!("keyvault-gw-{gateway}-{listener}")
}

/// What a listener asks for, before any cluster lookups happen.
#[derive(Debug, PartialEq)]
enum ListenerDemand {
    /// No TLS block or no cert option: any previously derived SPC goes.
    Cleanup,
    Certificate { cert_uri: String, service_account: String },
    Invalid(String),
}

fn classify_listener(listener: &Listener) -> ListenerDemand {
    let options = listener.tls.as_ref().and_then(|t| t.options.as_ref());
    let cert_uri = options.and_then(|o| o.get(TLS_CERT_KV_URI_OPTION));
    let service_account = options.and_then(|o| o.get(TLS_CERT_SERVICE_ACCOUNT_OPTION));
    match (cert_uri, service_account) {
        (None, None) => ListenerDemand::Cleanup,
        (Some(uri), Some(sa)) => ListenerDemand::Certificate {
            cert_uri: uri.clone(),
            service_account: sa.clone(),
        },
        (Some(_), None) => ListenerDemand::Invalid(format!(
            "listener \"{}\" sets the {TLS_CERT_KV_URI_OPTION} option but not {TLS_CERT_SERVICE_ACCOUNT_OPTION}",
            listener.name
        )),
        (None, Some(_)) => ListenerDemand::Invalid(format!(
            "listener \"{}\" sets the {TLS_CERT_SERVICE_ACCOUNT_OPTION} option but not {TLS_CERT_KV_URI_OPTION}",
            listener.name
        )),
    }
}

pub struct GatewayTranslator;

impl SpcTranslator for GatewayTranslator {
    type Input = Gateway;

    fn controller_name() -> ControllerName {
        ControllerName::new(&["gateway", "keyvault", "spc"])
    }

    fn owner_api(&self, ctx: &TranslatorCtx<'_>, input: &Gateway) -> Result<Api<Gateway>> {
        let namespace = input
            .namespace()
            .ok_or_else(|| Error::missing_object_key("namespace"))?;
        Ok(Api::namespaced(ctx.client.clone(), &namespace))
    }

    async fn spc_options(
        &self,
        ctx: &TranslatorCtx<'_>,
        gateway: &Gateway,
    ) -> Result<Vec<Result<SpcOptions<Gateway>>>> {
        if gateway.spec.gateway_class_name != MANAGED_GATEWAY_CLASS {
            return Ok(Vec::new());
        }
        let gateway_name = gateway.name_any();
        let namespace = gateway
            .namespace()
            .ok_or_else(|| Error::missing_object_key("namespace"))?;

        let mut items = Vec::new();
        for (index, listener) in gateway.spec.listeners.iter().enumerate() {
            let spc_name = listener_spc_name(&gateway_name, &listener.name);
            match classify_listener(listener) {
                ListenerDemand::Cleanup => {
                    items.push(Ok(SpcOptions::cleanup(spc_name, namespace.clone())));
                }
                ListenerDemand::Invalid(message) => {
                    items.push(Err(UserError::from_msg(message).into()));
                }
                ListenerDemand::Certificate {
                    cert_uri,
                    service_account,
                } => items.push(
                    self.certificate_options(
                        ctx,
                        &namespace,
                        spc_name,
                        index,
                        &cert_uri,
                        &service_account,
                    )
                    .await,
                ),
            }
        }
        Ok(items)
    }
}

impl GatewayTranslator {
    async fn certificate_options(
        &self,
        ctx: &TranslatorCtx<'_>,
        namespace: &str,
        spc_name: String,
        listener_index: usize,
        cert_uri: &str,
        service_account: &str,
    ) -> Result<SpcOptions<Gateway>> {
        // A missing dependency object is the user's to fix, not a retryable
        // cluster fault.
        let sa_api = Api::<ServiceAccount>::namespaced(ctx.client.clone(), namespace);
        let sa = sa_api.get_opt(service_account).await?.ok_or_else(|| {
            Error::from(UserError::from_msg(format!(
                "serviceAccount \"{service_account}\" does not exist in namespace \"{namespace}\""
            )))
        })?;
        let client_id = sa
            .annotations()
            .get(WI_CLIENT_ID_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                Error::from(UserError::from_msg(format!(
                    "serviceAccount \"{service_account}\" is missing the {WI_CLIENT_ID_ANNOTATION} annotation"
                )))
            })?;
        let parsed = parse_keyvault_cert_uri(cert_uri)?;

        let mut opts = SpcOptions::reconcile(spc_name.clone(), namespace.to_string());
        opts.client_id = Some(client_id);
        opts.tenant_id = Some(ctx.args.tenant_id().to_string());
        opts.vault_name = Some(parsed.vault_name);
        opts.cert_name = Some(parsed.cert_name);
        opts.object_version = parsed.object_version;
        opts.secret_name = Some(spc_name.clone());
        opts.cloud = Some(ctx.args.cloud().to_string());
        opts.workload_identity = true;

        let secret_namespace = namespace.to_string();
        opts.modify_owner = Some(Box::new(move |gateway: &mut Gateway| {
            if let Some(listener) = gateway.spec.listeners.get_mut(listener_index) {
                let tls = listener.tls.get_or_insert_with(Default::default);
                tls.certificate_refs = Some(vec![SecretObjectReference {
                    group: Some(String::new()),
                    kind: Some("Secret".to_string()),
                    name: spc_name.clone(),
                    namespace: Some(secret_namespace.clone()),
                }]);
            }
        }));
        Ok(opts)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn listener(name: &str, options: Option<&[(&str, &str)]>) -> Listener {
        Listener {
            name: name.to_string(),
            tls: options.map(|opts| ListenerTls {
                options: Some(
                    opts.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn listener_without_tls_is_cleanup() {
        assert_eq!(classify_listener(&listener("web", None)), ListenerDemand::Cleanup);
        assert_eq!(
            classify_listener(&listener("web", Some(&[]))),
            ListenerDemand::Cleanup
        );
    }

    #[test]
    fn half_configured_listener_is_a_user_error() {
        let only_uri = listener(
            "web",
            Some(&[(TLS_CERT_KV_URI_OPTION, "https://kv.vault.azure.net/secrets/c")]),
        );
        assert!(matches!(classify_listener(&only_uri), ListenerDemand::Invalid(_)));

        let only_sa = listener("web", Some(&[(TLS_CERT_SERVICE_ACCOUNT_OPTION, "sa")]));
        assert!(matches!(classify_listener(&only_sa), ListenerDemand::Invalid(_)));
    }

    #[test]
    fn fully_configured_listener_demands_a_certificate() {
        let l = listener(
            "web",
            Some(&[
                (TLS_CERT_KV_URI_OPTION, "https://kv.vault.azure.net/secrets/c"),
                (TLS_CERT_SERVICE_ACCOUNT_OPTION, "workload-sa"),
            ]),
        );
        assert_eq!(
            classify_listener(&l),
            ListenerDemand::Certificate {
                cert_uri: "https://kv.vault.azure.net/secrets/c".to_string(),
                service_account: "workload-sa".to_string(),
            }
        );
    }

    #[test]
    fn unmodelled_gateway_fields_round_trip() {
        let raw = serde_json::json!({
            "gatewayClassName": "istio",
            "listeners": [{
                "name": "https",
                "port": 443,
                "protocol": "HTTPS",
                "tls": {"mode": "Terminate"}
            }],
            "infrastructure": {"labels": {"team": "web"}}
        });
        let spec: GatewaySpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.listeners[0].extra["port"], 443);
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn spc_names_are_per_listener() {
        assert_eq!(listener_spc_name("gw", "https"), "keyvault-gw-gw-https");
        assert_ne!(listener_spc_name("gw", "a"), listener_spc_name("gw", "b"));
    }
}
