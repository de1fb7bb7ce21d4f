use k8s_openapi::api::networking::v1::{Ingress, IngressClass, IngressTLS};
use kube::{Api, ResourceExt as _};

use super::{
    keyvault_secret_name, uri::parse_keyvault_cert_uri, SpcOptions, SpcTranslator, TranslatorCtx,
    TLS_CERT_KV_MANAGED_ANNOTATION, TLS_CERT_KV_URI_ANNOTATION,
};
use crate::{
    controllers::{name::ControllerName, nginx::manifests::NGINX_CONTROLLER_CLASS_PREFIX},
    error::UserError,
    {Error, Result},
};

pub struct IngressTranslator;

impl SpcTranslator for IngressTranslator {
    type Input = Ingress;

    fn controller_name() -> ControllerName {
        ControllerName::new(&["ingress", "keyvault", "spc"])
    }

    fn owner_api(&self, ctx: &TranslatorCtx<'_>, input: &Ingress) -> Result<Api<Ingress>> {
        let namespace = input
            .namespace()
            .ok_or_else(|| Error::missing_object_key("namespace"))?;
        Ok(Api::namespaced(ctx.client.clone(), &namespace))
    }

    async fn spc_options(
        &self,
        ctx: &TranslatorCtx<'_>,
        ingress: &Ingress,
    ) -> Result<Vec<Result<SpcOptions<Ingress>>>> {
        let managed = is_managed_ingress(ctx, ingress).await?;
        Ok(translate_ingress(
            ingress,
            managed,
            ctx.args.msi_client_id().map(String::as_str),
            ctx.args.tenant_id(),
            ctx.args.cloud(),
        ))
    }
}

/// An ingress is managed when the class it names is claimed by one of this
/// operator's nginx controllers. A missing class means unmanaged, not an
/// error.
async fn is_managed_ingress(ctx: &TranslatorCtx<'_>, ingress: &Ingress) -> Result<bool> {
    let Some(class_name) = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_ref())
    else {
        return Ok(false);
    };
    let class_api = Api::<IngressClass>::all(ctx.client.clone());
    Ok(class_api
        .get_opt(class_name)
        .await?
        .and_then(|c| c.spec)
        .and_then(|s| s.controller)
        .is_some_and(|controller| controller.starts_with(NGINX_CONTROLLER_CLASS_PREFIX)))
}

fn translate_ingress(
    ingress: &Ingress,
    managed: bool,
    msi_client_id: Option<&str>,
    tenant_id: &str,
    cloud: &str,
) -> Vec<Result<SpcOptions<Ingress>>> {
    let name = keyvault_secret_name(&ingress.name_any());
    let Some(namespace) = ingress.namespace() else {
        return vec![Err(Error::missing_object_key("namespace"))];
    };
    let uri = ingress.annotations().get(TLS_CERT_KV_URI_ANNOTATION);

    let (managed, uri) = match (managed, uri) {
        (true, Some(uri)) => (managed, uri),
        _ => return vec![Ok(SpcOptions::cleanup(name, namespace))],
    };
    debug_assert!(managed);

    let parsed = match parse_keyvault_cert_uri(uri) {
        Ok(parsed) => parsed,
        Err(e) => return vec![Err(e)],
    };
    let Some(client_id) = msi_client_id else {
        return vec![Err(UserError::from_msg(
            "the operator is not configured with a managed identity client id; \
             keyvault certificates on ingresses are unavailable",
        )
        .into())];
    };

    let mut opts = SpcOptions::reconcile(name.clone(), namespace);
    opts.client_id = Some(client_id.to_string());
    opts.tenant_id = Some(tenant_id.to_string());
    opts.vault_name = Some(parsed.vault_name);
    opts.cert_name = Some(parsed.cert_name);
    opts.object_version = parsed.object_version;
    opts.secret_name = Some(name.clone());
    opts.cloud = (!cloud.is_empty()).then(|| cloud.to_string());

    let keyvault_managed = ingress
        .annotations()
        .get(TLS_CERT_KV_MANAGED_ANNOTATION)
        .is_some_and(|v| v.to_lowercase() == "true");
    if keyvault_managed {
        let secret_name = name;
        let hosts = collect_hosts(ingress);
        opts.modify_owner = Some(Box::new(move |ingress: &mut Ingress| {
            let spec = ingress.spec.get_or_insert_with(Default::default);
            spec.tls = Some(vec![IngressTLS {
                secret_name: Some(secret_name.clone()),
                hosts: (!hosts.is_empty()).then(|| hosts.clone()),
            }]);
        }));
    }
    vec![Ok(opts)]
}

/// Every host named by the rules, empties dropped, first occurrence wins.
fn collect_hosts(ingress: &Ingress) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for rule in ingress
        .spec
        .iter()
        .flat_map(|s| s.rules.iter())
        .flatten()
    {
        if let Some(host) = rule.host.as_ref().filter(|h| !h.is_empty()) {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
    }
    hosts
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use k8s_openapi::api::networking::v1::{IngressRule, IngressSpec};
    use kube::api::ObjectMeta;

    use super::{super::SpcAction, *};

    fn ingress(
        class: Option<&str>,
        annotations: &[(&str, &str)],
        hosts: &[&str],
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                rules: Some(
                    hosts
                        .iter()
                        .map(|h| IngressRule {
                            host: (!h.is_empty()).then(|| h.to_string()),
                            http: None,
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    const URI: &str = "https://mykv.vault.azure.net/secrets/mycert";

    #[test]
    fn unmanaged_ingress_yields_cleanup() {
        let ing = ingress(
            Some("unmanaged.ingress.class"),
            &[(TLS_CERT_KV_URI_ANNOTATION, URI)],
            &["managed.example.com"],
        );
        let items = translate_ingress(&ing, false, Some("client"), "tenant", "cloud");
        assert_eq!(items.len(), 1);
        let opts = items.into_iter().next().unwrap().unwrap();
        assert!(matches!(opts.action, SpcAction::Cleanup));
        assert_eq!(opts.name, "keyvault-web");
        assert_eq!(opts.namespace, "default");
        assert!(opts.modify_owner.is_none());
    }

    #[test]
    fn managed_ingress_without_annotation_yields_cleanup() {
        let ing = ingress(Some("managed"), &[], &["a.example.com"]);
        let items = translate_ingress(&ing, true, Some("client"), "tenant", "cloud");
        let opts = items.into_iter().next().unwrap().unwrap();
        assert!(matches!(opts.action, SpcAction::Cleanup));
    }

    #[test]
    fn managed_ingress_yields_a_reconcile_with_parsed_uri() {
        let ing = ingress(
            Some("managed"),
            &[(TLS_CERT_KV_URI_ANNOTATION, URI)],
            &["managed.example.com"],
        );
        let items = translate_ingress(&ing, true, Some("client-1"), "tenant-1", "AzurePublicCloud");
        let opts = items.into_iter().next().unwrap().unwrap();
        assert!(matches!(opts.action, SpcAction::Reconcile));
        assert_eq!(opts.vault_name.as_deref(), Some("mykv"));
        assert_eq!(opts.cert_name.as_deref(), Some("mycert"));
        assert_eq!(opts.secret_name.as_deref(), Some("keyvault-web"));
        assert_eq!(opts.client_id.as_deref(), Some("client-1"));
        assert!(!opts.workload_identity);
        // No managed annotation: the ingress itself stays untouched.
        assert!(opts.modify_owner.is_none());
    }

    #[test]
    fn managed_annotation_installs_the_tls_block() {
        let ing = ingress(
            Some("managed"),
            &[
                (TLS_CERT_KV_URI_ANNOTATION, URI),
                (TLS_CERT_KV_MANAGED_ANNOTATION, "true"),
            ],
            &["managed.example.com", "", "managed.example.com", "second.example.com"],
        );
        let items = translate_ingress(&ing, true, Some("client"), "tenant", "cloud");
        let opts = items.into_iter().next().unwrap().unwrap();
        let modify = opts.modify_owner.expect("owner mutation expected");

        let mut owned = ing.clone();
        modify(&mut owned);
        let tls = owned.spec.unwrap().tls.unwrap();
        assert_eq!(tls.len(), 1);
        assert_eq!(tls[0].secret_name.as_deref(), Some("keyvault-web"));
        assert_eq!(
            tls[0].hosts.as_ref().unwrap(),
            &["managed.example.com".to_string(), "second.example.com".to_string()]
        );
    }

    #[test]
    fn bad_uri_is_a_user_error_item() {
        let ing = ingress(
            Some("managed"),
            &[(TLS_CERT_KV_URI_ANNOTATION, "https://nodots/secrets/c")],
            &[],
        );
        let items = translate_ingress(&ing, true, Some("client"), "tenant", "cloud");
        match items.into_iter().next().unwrap() {
            Err(e) => assert!(e.as_user_error().is_some()),
            Ok(_) => panic!("expected a user error"),
        }
    }
}
