mod customresource;
pub mod gateway;
pub mod ingress;
pub mod nginx;
pub mod uri;

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

pub use customresource::{
    SecretObject, SecretObjectData, SecretProviderClass, SecretProviderClassSpec,
};
use futures::StreamExt as _;
use kube::{
    api::DeleteParams,
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
        watcher::Config,
        Controller,
    },
    Api, Client, Resource, ResourceExt as _,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use super::{
    complete_reconcile, is_operator_managed, managed_labels, name::ControllerName, upsert,
    ReconcileResult,
};
use crate::{
    cli::ControllerArgs,
    metrics::Metrics,
    {Error, Result},
};

/// Annotations recognised on Ingress objects.
pub const TLS_CERT_KV_URI_ANNOTATION: &str = "kubernetes.azure.com/tls-cert-keyvault-uri";
pub const TLS_CERT_KV_MANAGED_ANNOTATION: &str = "kubernetes.azure.com/tls-cert-keyvault-managed";

/// TLS options recognised on Gateway listeners.
pub const TLS_CERT_KV_URI_OPTION: &str = "kubernetes.azure.com/tls-cert-keyvault-uri";
pub const TLS_CERT_SERVICE_ACCOUNT_OPTION: &str = "kubernetes.azure.com/tls-cert-service-account";

/// Workload-identity client id annotation on service accounts.
pub const WI_CLIENT_ID_ANNOTATION: &str = "azure.workload.identity/client-id";

/// Name of the SPC and of the secret it materialises, for an owner object.
pub fn keyvault_secret_name(owner_name: &str) -> String {
    format!("keyvault-{owner_name}")
}

pub enum SpcAction {
    Reconcile,
    Cleanup,
}

/// One derived SPC, or the removal of one, as requested by a translator.
/// For cleanup only the coordinates matter.
pub struct SpcOptions<I> {
    pub action: SpcAction,
    pub name: String,
    pub namespace: String,
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub vault_name: Option<String>,
    pub cert_name: Option<String>,
    pub object_version: Option<String>,
    pub secret_name: Option<String>,
    pub cloud: Option<String>,
    pub workload_identity: bool,
    /// Runs against an in-memory copy of the input; a single write-back
    /// follows once the whole sequence applied.
    pub modify_owner: Option<Box<dyn FnOnce(&mut I) + Send + Sync>>,
}

impl<I> SpcOptions<I> {
    pub fn cleanup(name: String, namespace: String) -> Self {
        Self {
            action: SpcAction::Cleanup,
            name,
            namespace,
            client_id: None,
            tenant_id: None,
            vault_name: None,
            cert_name: None,
            object_version: None,
            secret_name: None,
            cloud: None,
            workload_identity: false,
            modify_owner: None,
        }
    }

    pub fn reconcile(name: String, namespace: String) -> Self {
        Self {
            action: SpcAction::Reconcile,
            ..Self::cleanup(name, namespace)
        }
    }
}

pub struct TranslatorCtx<'a> {
    pub client: &'a Client,
    pub args: &'a ControllerArgs,
}

/// Turns one input object into an ordered sequence of SPC records. Each
/// element may itself be a user error; the reconciler applies elements in
/// order and stops at the first failed one, leaving earlier applications
/// in place.
#[allow(async_fn_in_trait)]
pub trait SpcTranslator: Send + Sync + Sized + 'static {
    type Input: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync;

    fn controller_name() -> ControllerName;
    fn owner_api(&self, ctx: &TranslatorCtx<'_>, input: &Self::Input) -> Result<Api<Self::Input>>;
    async fn spc_options(
        &self,
        ctx: &TranslatorCtx<'_>,
        input: &Self::Input,
    ) -> Result<Vec<Result<SpcOptions<Self::Input>>>>;
}

struct Context<T: SpcTranslator> {
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    controller_name: ControllerName,
    recorder: Recorder,
    translator: T,
}

/// Runs the three SPC controllers (Ingress, Gateway,
/// NginxIngressController inputs) until shutdown.
pub async fn run_controllers(client: Client, args: ControllerArgs, metrics: Metrics) -> Result<()> {
    let (_, _, _) = tokio::join!(
        run_controller(
            client.clone(),
            args.clone(),
            metrics.clone(),
            ingress::IngressTranslator
        ),
        run_controller(
            client.clone(),
            args.clone(),
            metrics.clone(),
            gateway::GatewayTranslator
        ),
        run_controller(client, args, metrics, nginx::NginxCertTranslator),
    );
    Ok(())
}

async fn run_controller<T: SpcTranslator>(
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    translator: T,
) {
    let controller_name = T::controller_name();
    info!("Starting controller for {}", controller_name);
    metrics.reconcile.init_controller(&controller_name);
    let context = Arc::new(Context {
        recorder: Recorder::new(
            client.clone(),
            Reporter {
                controller: controller_name.logger_name(),
                instance: None,
            },
        ),
        client: client.clone(),
        args,
        metrics,
        controller_name: controller_name.clone(),
        translator,
    });

    let api = Api::<T::Input>::all(client.clone());
    Controller::new(api, Config::default().any_semantic())
        .owns(
            Api::<SecretProviderClass>::all(client),
            Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller for {} shutdown", controller_name);
}

async fn reconcile<T: SpcTranslator>(
    input: Arc<T::Input>,
    ctx: Arc<Context<T>>,
) -> Result<Action> {
    let result = ctx.reconcile_input(&input).await;
    complete_reconcile(&ctx.metrics, &ctx.controller_name, result)
}

fn error_policy<T: SpcTranslator>(_: Arc<T::Input>, error: &Error, _ctx: Arc<Context<T>>) -> Action {
    warn!("reconcile failed: {error:?}");
    Action::requeue(Duration::from_secs(60))
}

impl<T: SpcTranslator> Context<T> {
    async fn reconcile_input(&self, input: &T::Input) -> Result<ReconcileResult> {
        let translator_ctx = TranslatorCtx {
            client: &self.client,
            args: &self.args,
        };
        let items = match self.translator.spc_options(&translator_ctx, input).await {
            Ok(items) => items,
            Err(e) => return self.handle_user_error(e, input).await,
        };

        let mut owned = input.clone();
        let mut owner_updated = false;
        for item in items {
            let opts = match item {
                Ok(opts) => opts,
                Err(e) => return self.handle_user_error(e, input).await,
            };
            match opts.action {
                SpcAction::Cleanup => self.cleanup_spc(&opts).await?,
                SpcAction::Reconcile => {
                    let spc = build_spc(&opts, input)?;
                    let api = Api::<SecretProviderClass>::namespaced(
                        self.client.clone(),
                        &opts.namespace,
                    );
                    if let Err(e) = upsert::upsert(&api, &spc).await {
                        if !e.is_conflict() {
                            self.publish_warning(
                                input,
                                "FailedUpdateOrCreateSPC",
                                &format!(
                                    "applying SecretProviderClass {}/{} failed",
                                    opts.namespace, opts.name
                                ),
                            )
                            .await;
                        }
                        return Err(e);
                    }
                    if let Some(modify) = opts.modify_owner {
                        modify(&mut owned);
                        owner_updated = true;
                    }
                }
            }
        }

        if owner_updated {
            let api = self.translator.owner_api(&translator_ctx, input)?;
            let name = input.name_any();
            if let Err(e) = api
                .replace(&name, &Default::default(), &owned)
                .await
                .map_err(Error::from)
            {
                if e.is_conflict() {
                    return Ok(ReconcileResult::requeue_now());
                }
                self.publish_warning(
                    input,
                    "FailedUpdateUpstreamCertRef",
                    "installing the certificate reference on the object failed",
                )
                .await;
                return Err(e);
            }
        }
        Ok(ReconcileResult::success())
    }

    /// Deletes a derived SPC, but only when it carries the operator
    /// marker; a user-authored object with the same coordinates is left
    /// alone.
    async fn cleanup_spc(&self, opts: &SpcOptions<T::Input>) -> Result<()> {
        let api = Api::<SecretProviderClass>::namespaced(self.client.clone(), &opts.namespace);
        let Some(existing) = api.get_opt(&opts.name).await? else {
            return Ok(());
        };
        if !is_operator_managed(&existing.metadata) {
            info!(
                "SecretProviderClass {}/{} is not operator-managed, leaving it in place",
                opts.namespace, opts.name
            );
            return Ok(());
        }
        api.delete(&opts.name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn handle_user_error(&self, error: Error, input: &T::Input) -> Result<ReconcileResult> {
        let Some(user) = error.as_user_error() else {
            return Err(error);
        };
        warn!(
            "invalid {} \"{}\": {}",
            T::Input::kind(&()),
            input.name_any(),
            user.dev_message()
        );
        let event = Event {
            type_: EventType::Warning,
            reason: "InvalidInput".to_string(),
            note: Some(user.user_message().to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &input.object_ref(&())).await {
            warn!("publishing InvalidInput event failed: {e}");
        }
        Ok(ReconcileResult::success())
    }

    async fn publish_warning(&self, input: &T::Input, reason: &str, note: &str) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &input.object_ref(&())).await {
            warn!("publishing {reason} event failed: {e}");
        }
    }
}

/// Builds the SPC object for a reconcile record, owned by the input.
fn build_spc<I>(opts: &SpcOptions<I>, input: &I) -> Result<SecretProviderClass>
where
    I: Resource<DynamicType = ()>,
{
    let owner = input
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing_object_key("uid"))?;
    let cert_name = opts
        .cert_name
        .as_ref()
        .ok_or_else(|| Error::missing_object_key("certName"))?;
    let secret_name = opts
        .secret_name
        .as_ref()
        .ok_or_else(|| Error::missing_object_key("secretName"))?;

    let mut parameters = BTreeMap::from([
        (
            "keyvaultName".to_string(),
            opts.vault_name.clone().unwrap_or_default(),
        ),
        (
            "tenantId".to_string(),
            opts.tenant_id.clone().unwrap_or_default(),
        ),
        (
            "objects".to_string(),
            objects_json(cert_name, opts.object_version.as_deref())?,
        ),
    ]);
    let client_id = opts.client_id.clone().unwrap_or_default();
    if opts.workload_identity {
        parameters.insert("clientID".to_string(), client_id);
    } else {
        parameters.insert("useVMManagedIdentity".to_string(), "true".to_string());
        parameters.insert("userAssignedIdentityID".to_string(), client_id);
    }
    if let Some(cloud) = opts.cloud.as_ref().filter(|c| !c.is_empty()) {
        parameters.insert("cloud".to_string(), cloud.clone());
    }

    Ok(SecretProviderClass {
        metadata: kube::api::ObjectMeta {
            name: Some(opts.name.clone()),
            namespace: Some(opts.namespace.clone()),
            labels: Some(managed_labels()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: SecretProviderClassSpec {
            provider: "azure".to_string(),
            parameters: Some(parameters),
            secret_objects: Some(vec![SecretObject {
                secret_name: secret_name.clone(),
                type_: "kubernetes.io/tls".to_string(),
                data: vec![
                    SecretObjectData {
                        object_name: cert_name.clone(),
                        key: "tls.key".to_string(),
                    },
                    SecretObjectData {
                        object_name: cert_name.clone(),
                        key: "tls.crt".to_string(),
                    },
                ],
            }]),
        },
    })
}

/// The CSI driver wants the object list as doubly-encoded JSON: the outer
/// document holds the string form of each inner object.
fn objects_json(cert_name: &str, object_version: Option<&str>) -> Result<String> {
    let mut inner = serde_json::Map::new();
    inner.insert("objectName".to_string(), cert_name.into());
    inner.insert("objectType".to_string(), "secret".into());
    if let Some(version) = object_version {
        inner.insert("objectVersion".to_string(), version.into());
    }
    let inner = serde_json::to_string(&serde_json::Value::Object(inner))?;
    let outer = serde_json::json!({ "array": [inner] });
    Ok(serde_json::to_string(&outer)?)
}

#[cfg(test)]
mod test {
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::controllers::is_operator_managed;

    fn owner_ingress() -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-ingress".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn reconcile_opts() -> SpcOptions<Ingress> {
        let mut opts = SpcOptions::reconcile("keyvault-web".to_string(), "default".to_string());
        opts.client_id = Some("client-1".to_string());
        opts.tenant_id = Some("tenant-1".to_string());
        opts.vault_name = Some("mykv".to_string());
        opts.cert_name = Some("mycert".to_string());
        opts.secret_name = Some("keyvault-web".to_string());
        opts.cloud = Some("AzurePublicCloud".to_string());
        opts
    }

    #[test]
    fn objects_json_is_doubly_encoded() {
        let objects = objects_json("mycert", None).unwrap();
        let outer: serde_json::Value = serde_json::from_str(&objects).unwrap();
        let inner_str = outer["array"][0].as_str().expect("inner should be a string");
        let inner: serde_json::Value = serde_json::from_str(inner_str).unwrap();
        assert_eq!(inner["objectName"], "mycert");
        assert_eq!(inner["objectType"], "secret");
        assert!(inner.get("objectVersion").is_none());

        let versioned = objects_json("mycert", Some("v2")).unwrap();
        let outer: serde_json::Value = serde_json::from_str(&versioned).unwrap();
        let inner: serde_json::Value =
            serde_json::from_str(outer["array"][0].as_str().unwrap()).unwrap();
        assert_eq!(inner["objectVersion"], "v2");
    }

    #[test]
    fn managed_identity_parameters() {
        let spc = build_spc(&reconcile_opts(), &owner_ingress()).unwrap();
        let params = spc.spec.parameters.unwrap();
        assert_eq!(spc.spec.provider, "azure");
        assert_eq!(params["keyvaultName"], "mykv");
        assert_eq!(params["tenantId"], "tenant-1");
        assert_eq!(params["useVMManagedIdentity"], "true");
        assert_eq!(params["userAssignedIdentityID"], "client-1");
        assert_eq!(params["cloud"], "AzurePublicCloud");
        assert!(!params.contains_key("clientID"));
    }

    #[test]
    fn workload_identity_parameters() {
        let mut opts = reconcile_opts();
        opts.workload_identity = true;
        let spc = build_spc(&opts, &owner_ingress()).unwrap();
        let params = spc.spec.parameters.unwrap();
        assert_eq!(params["clientID"], "client-1");
        assert!(!params.contains_key("useVMManagedIdentity"));
        assert!(!params.contains_key("userAssignedIdentityID"));
    }

    #[test]
    fn secret_objects_map_the_tls_keys() {
        let spc = build_spc(&reconcile_opts(), &owner_ingress()).unwrap();
        let objects = spc.spec.secret_objects.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].secret_name, "keyvault-web");
        assert_eq!(objects[0].type_, "kubernetes.io/tls");
        let keys: Vec<_> = objects[0].data.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, ["tls.key", "tls.crt"]);
        assert!(objects[0].data.iter().all(|d| d.object_name == "mycert"));
    }

    #[test]
    fn spc_is_marked_and_owned() {
        let spc = build_spc(&reconcile_opts(), &owner_ingress()).unwrap();
        assert!(is_operator_managed(&spc.metadata));
        let owners = spc.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-ingress");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].kind, "Ingress");
    }

    #[test]
    fn build_is_idempotent() {
        let first = build_spc(&reconcile_opts(), &owner_ingress()).unwrap();
        let second = build_spc(&reconcile_opts(), &owner_ingress()).unwrap();
        assert_eq!(first, second);
    }
}
