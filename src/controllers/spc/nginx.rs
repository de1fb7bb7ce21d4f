use kube::{Api, ResourceExt as _};

use super::{
    keyvault_secret_name, uri::parse_keyvault_cert_uri, SpcOptions, SpcTranslator, TranslatorCtx,
};
use crate::{
    controllers::{name::ControllerName, nginx::NginxIngressController},
    error::UserError,
    Result,
};

/// Derives the SPC carrying an ingress controller's default SSL
/// certificate. The nginx reconciler separately points the controller
/// deployment at the materialised secret.
pub struct NginxCertTranslator;

impl SpcTranslator for NginxCertTranslator {
    type Input = NginxIngressController;

    fn controller_name() -> ControllerName {
        ControllerName::new(&["nginx", "keyvault", "spc"])
    }

    fn owner_api(
        &self,
        ctx: &TranslatorCtx<'_>,
        _input: &NginxIngressController,
    ) -> Result<Api<NginxIngressController>> {
        Ok(Api::all(ctx.client.clone()))
    }

    async fn spc_options(
        &self,
        ctx: &TranslatorCtx<'_>,
        nic: &NginxIngressController,
    ) -> Result<Vec<Result<SpcOptions<NginxIngressController>>>> {
        Ok(translate_nic(
            nic,
            ctx.args.operator_namespace(),
            ctx.args.msi_client_id().map(String::as_str),
            ctx.args.tenant_id(),
            ctx.args.cloud(),
        ))
    }
}

fn translate_nic(
    nic: &NginxIngressController,
    operator_namespace: &str,
    msi_client_id: Option<&str>,
    tenant_id: &str,
    cloud: &str,
) -> Vec<Result<SpcOptions<NginxIngressController>>> {
    let name = keyvault_secret_name(&nic.name_any());
    let Some(uri) = nic.keyvault_uri() else {
        return vec![Ok(SpcOptions::cleanup(name, operator_namespace.to_string()))];
    };
    let parsed = match parse_keyvault_cert_uri(uri) {
        Ok(parsed) => parsed,
        Err(e) => return vec![Err(e)],
    };
    let Some(client_id) = msi_client_id else {
        return vec![Err(UserError::from_msg(
            "the operator is not configured with a managed identity client id; \
             keyvault default certificates are unavailable",
        )
        .into())];
    };

    let mut opts = SpcOptions::reconcile(name.clone(), operator_namespace.to_string());
    opts.client_id = Some(client_id.to_string());
    opts.tenant_id = Some(tenant_id.to_string());
    opts.vault_name = Some(parsed.vault_name);
    opts.cert_name = Some(parsed.cert_name);
    opts.object_version = parsed.object_version;
    opts.secret_name = Some(name);
    opts.cloud = (!cloud.is_empty()).then(|| cloud.to_string());
    vec![Ok(opts)]
}

#[cfg(test)]
mod test {
    use super::{super::SpcAction, *};
    use crate::controllers::nginx::{
        DefaultSSLCertificate, NginxIngressControllerSpec,
    };

    fn nic(uri: Option<&str>) -> NginxIngressController {
        NginxIngressController::new(
            "webapp",
            NginxIngressControllerSpec {
                default_ssl_certificate: uri.map(|u| DefaultSSLCertificate {
                    key_vault_uri: Some(u.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn no_keyvault_uri_yields_cleanup() {
        let items = translate_nic(&nic(None), "app-routing-system", Some("c"), "t", "cloud");
        let opts = items.into_iter().next().unwrap().unwrap();
        assert!(matches!(opts.action, SpcAction::Cleanup));
        assert_eq!(opts.name, "keyvault-webapp");
        assert_eq!(opts.namespace, "app-routing-system");
    }

    #[test]
    fn keyvault_uri_yields_a_managed_identity_reconcile() {
        let items = translate_nic(
            &nic(Some("https://kv.vault.azure.net/secrets/default-cert/v7")),
            "app-routing-system",
            Some("client-1"),
            "tenant-1",
            "AzureCloud",
        );
        let opts = items.into_iter().next().unwrap().unwrap();
        assert!(matches!(opts.action, SpcAction::Reconcile));
        assert_eq!(opts.vault_name.as_deref(), Some("kv"));
        assert_eq!(opts.cert_name.as_deref(), Some("default-cert"));
        assert_eq!(opts.object_version.as_deref(), Some("v7"));
        assert!(!opts.workload_identity);
        assert!(opts.modify_owner.is_none());
    }

    #[test]
    fn missing_identity_is_a_user_error() {
        let items = translate_nic(
            &nic(Some("https://kv.vault.azure.net/secrets/c")),
            "ns",
            None,
            "t",
            "cloud",
        );
        match &items[0] {
            Err(e) => assert!(e.as_user_error().is_some()),
            Ok(_) => panic!("expected a user error"),
        }
    }
}
