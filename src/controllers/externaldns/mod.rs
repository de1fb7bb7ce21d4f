mod customresource;
pub mod manifests;
pub mod zones;

use std::{sync::Arc, time::Duration};

pub use customresource::{
    ClusterExternalDNS, ClusterExternalDNSSpec, ExternalDNS, ExternalDNSFilters,
    ExternalDNSIdentity, ExternalDNSSpec, ExternalDNSStatus, RESOURCE_TYPE_GATEWAY,
    RESOURCE_TYPE_INGRESS,
};
use futures::StreamExt as _;
use garde::Validate as _;
use k8s_openapi::{
    api::{apps::v1::Deployment, core::v1::ConfigMap, core::v1::ServiceAccount},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{ObjectMeta, Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
        watcher::Config,
        Controller,
    },
    Api, Client, Resource, ResourceExt as _,
};
use tracing::{info, warn};

use self::manifests::{ExternalDnsConfig, IdentityMode, ResourceType};
use super::{
    complete_reconcile, name::ControllerName, new_condition, upsert, upsert_condition,
    ReconcileResult, FIELD_MANAGER,
};
use crate::{
    cli::ControllerArgs,
    error::UserError,
    metrics::Metrics,
    {Error, Result},
};

const CONDITION_AVAILABLE: &str = "Available";

struct Context {
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    controller_name: ControllerName,
    recorder: Recorder,
}

impl Context {
    fn new(client: Client, args: ControllerArgs, metrics: Metrics, name: ControllerName) -> Self {
        let reporter = Reporter {
            controller: name.logger_name(),
            instance: None,
        };
        metrics.reconcile.init_controller(&name);
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            args,
            metrics,
            controller_name: name,
        }
    }
}

/// Runs both externalDNS input controllers until shutdown.
pub async fn run_controllers(client: Client, args: ControllerArgs, metrics: Metrics) -> Result<()> {
    let (_, _) = tokio::join!(
        run_namespaced_controller(client.clone(), args.clone(), metrics.clone()),
        run_cluster_controller(client, args, metrics),
    );
    Ok(())
}

async fn run_namespaced_controller(client: Client, args: ControllerArgs, metrics: Metrics) {
    info!("Starting controller for ExternalDNS");
    let context = Arc::new(Context::new(
        client.clone(),
        args,
        metrics,
        ControllerName::new(&["external", "dns"]),
    ));
    let api = Api::<ExternalDNS>::all(client.clone());

    Controller::new(api, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), Config::default())
        .owns(Api::<ConfigMap>::all(client), Config::default())
        .shutdown_on_signal()
        .run(reconcile_namespaced, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller for ExternalDNS shutdown");
}

async fn run_cluster_controller(client: Client, args: ControllerArgs, metrics: Metrics) {
    info!("Starting controller for ClusterExternalDNS");
    let context = Arc::new(Context::new(
        client.clone(),
        args,
        metrics,
        ControllerName::new(&["cluster", "external", "dns"]),
    ));
    let api = Api::<ClusterExternalDNS>::all(client.clone());

    Controller::new(api, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), Config::default())
        .owns(Api::<ConfigMap>::all(client), Config::default())
        .shutdown_on_signal()
        .run(reconcile_cluster, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller for ClusterExternalDNS shutdown");
}

async fn reconcile_namespaced(res: Arc<ExternalDNS>, ctx: Arc<Context>) -> Result<Action> {
    let result = ctx.reconcile_namespaced(&res).await;
    complete_reconcile(&ctx.metrics, &ctx.controller_name, result)
}

async fn reconcile_cluster(res: Arc<ClusterExternalDNS>, ctx: Arc<Context>) -> Result<Action> {
    let result = ctx.reconcile_cluster(&res).await;
    complete_reconcile(&ctx.metrics, &ctx.controller_name, result)
}

fn error_policy<K>(_: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    Action::requeue(Duration::from_secs(5 * 60))
}

impl Context {
    async fn reconcile_namespaced(&self, edns: &ExternalDNS) -> Result<ReconcileResult> {
        let name = edns.name_any();
        let namespace = edns
            .namespace()
            .ok_or_else(|| Error::missing_object_key("namespace"))?;
        info!("Reconciling ExternalDNS \"{name}\" in {namespace}");

        let config = match self
            .derive_config(&edns.spec.clone().into_common(), &namespace, true)
            .await
        {
            Ok(config) => config,
            Err(e) => {
                return self.handle_user_error(e, edns).await
            }
        };

        let owner = edns
            .controller_owner_ref(&())
            .ok_or_else(|| Error::missing_object_key("uid"))?;
        self.apply(&config, &owner).await?;

        let mut status = edns.status.clone().unwrap_or_default();
        status.observed_generation = edns.metadata.generation;
        upsert_condition(
            status.conditions.get_or_insert_with(Vec::new),
            new_condition(
                CONDITION_AVAILABLE,
                true,
                "Deployed",
                "externalDNS resources applied",
                edns.metadata.generation,
            ),
        );
        patch_status(
            &Api::<ExternalDNS>::namespaced(self.client.clone(), &namespace),
            &name,
            edns.status.as_ref(),
            status,
            |status| ExternalDNS {
                metadata: ObjectMeta::default(),
                spec: ExternalDNSSpec::default(),
                status: Some(status),
            },
        )
        .await?;
        Ok(ReconcileResult::success())
    }

    async fn reconcile_cluster(&self, edns: &ClusterExternalDNS) -> Result<ReconcileResult> {
        let name = edns.name_any();
        info!("Reconciling ClusterExternalDNS \"{name}\"");
        let namespace = edns.spec.resource_namespace.clone();

        let config = match self
            .derive_config(&edns.spec.clone().into_common(), &namespace, false)
            .await
        {
            Ok(config) => config,
            Err(e) => {
                return self.handle_user_error(e, edns).await
            }
        };

        let owner = edns
            .controller_owner_ref(&())
            .ok_or_else(|| Error::missing_object_key("uid"))?;
        self.apply(&config, &owner).await?;

        let mut status = edns.status.clone().unwrap_or_default();
        status.observed_generation = edns.metadata.generation;
        upsert_condition(
            status.conditions.get_or_insert_with(Vec::new),
            new_condition(
                CONDITION_AVAILABLE,
                true,
                "Deployed",
                "externalDNS resources applied",
                edns.metadata.generation,
            ),
        );
        patch_status(
            &Api::<ClusterExternalDNS>::all(self.client.clone()),
            &name,
            edns.status.as_ref(),
            status,
            |status| ClusterExternalDNS {
                metadata: ObjectMeta::default(),
                spec: ClusterExternalDNSSpec::default(),
                status: Some(status),
            },
        )
        .await?;
        Ok(ReconcileResult::success())
    }

    /// Validates the user-facing spec and turns it into a deployment
    /// descriptor. Everything that can fail here is a user error.
    async fn derive_config(
        &self,
        spec: &CommonSpec,
        namespace: &str,
        namespace_limited: bool,
    ) -> Result<ExternalDnsConfig> {
        if let Err(report) = &spec.validation {
            return Err(UserError::new(
                format!("spec is invalid: {report}"),
                format!("garde validation failed: {report}"),
            )
            .into());
        }
        let zones = zones::DnsZoneConfig::from_ids(&spec.dns_zone_resource_ids)?;

        let sa_api = Api::<ServiceAccount>::namespaced(self.client.clone(), namespace);
        if sa_api.get_opt(&spec.service_account).await?.is_none() {
            return Err(UserError::from_msg(format!(
                "serviceAccount \"{}\" does not exist in namespace \"{namespace}\"",
                spec.service_account
            ))
            .into());
        }

        let resource_types = match &spec.resource_types {
            None => vec![ResourceType::Ingress],
            Some(types) => types
                .iter()
                .map(|t| match t.as_str() {
                    RESOURCE_TYPE_INGRESS => Ok(ResourceType::Ingress),
                    RESOURCE_TYPE_GATEWAY => Ok(ResourceType::Gateway),
                    other => Err(Error::from(UserError::from_msg(format!(
                        "unsupported resource type \"{other}\""
                    )))),
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(ExternalDnsConfig {
            tenant_id: spec.tenant_id.clone(),
            cluster_uid: self.args.cluster_uid().to_string(),
            cloud: self.args.cloud().to_string(),
            location: self.args.location().cloned(),
            namespace: namespace.to_string(),
            zones,
            resource_types,
            identity: IdentityMode::WorkloadIdentity {
                service_account: spec.service_account.clone(),
            },
            sync_interval_seconds: self.args.dns_sync_interval_seconds(),
            namespace_limited,
            gateway_label_filter: spec.gateway_label_filter.clone(),
            route_and_ingress_label_filter: spec.route_and_ingress_label_filter.clone(),
        })
    }

    async fn apply(&self, config: &ExternalDnsConfig, owner: &OwnerReference) -> Result<()> {
        let resources = manifests::external_dns_resources(config, Some(owner))?;
        let ns = &config.namespace;

        if let Some(sa) = &resources.service_account {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), sa).await?;
        }
        if let Some(role) = &resources.role {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), role).await?;
        }
        if let Some(binding) = &resources.role_binding {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), binding).await?;
        }
        if let Some(role) = &resources.cluster_role {
            upsert::upsert(&Api::all(self.client.clone()), role).await?;
        }
        if let Some(binding) = &resources.cluster_role_binding {
            upsert::upsert(&Api::all(self.client.clone()), binding).await?;
        }
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.configmap).await?;
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.deployment).await?;
        Ok(())
    }

    /// User errors surface as a warning event plus a status condition and
    /// count as success so the work queue stays quiet until the user edits
    /// the input.
    async fn handle_user_error<K>(&self, error: Error, obj: &K) -> Result<ReconcileResult>
    where
        K: StatusConditions,
    {
        let Some(user) = error.as_user_error() else {
            return Err(error);
        };
        warn!(
            "invalid {} \"{}\": {}",
            K::kind(&()),
            obj.name_any(),
            user.dev_message()
        );
        self.publish_invalid_input(obj, user).await;

        let mut status = obj.status_or_default();
        let generation = obj.meta().generation;
        upsert_condition(
            status.conditions.get_or_insert_with(Vec::new),
            new_condition(
                CONDITION_AVAILABLE,
                false,
                "InvalidInput",
                user.user_message(),
                generation,
            ),
        );
        status.observed_generation = generation;
        obj.patch_own_status(&self.client, status).await?;
        Ok(ReconcileResult::success())
    }

    async fn publish_invalid_input<K: Resource<DynamicType = ()>>(
        &self,
        obj: &K,
        user: &UserError,
    ) {
        let event = Event {
            type_: EventType::Warning,
            reason: "InvalidInput".to_string(),
            note: Some(user.user_message().to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            warn!("publishing InvalidInput event failed: {e}");
        }
    }
}

/// The fields shared by the namespaced and the cluster-scoped spec, plus
/// the garde outcome so validation happens exactly once.
struct CommonSpec {
    tenant_id: String,
    dns_zone_resource_ids: Vec<String>,
    resource_types: Option<Vec<String>>,
    service_account: String,
    gateway_label_filter: Option<String>,
    route_and_ingress_label_filter: Option<String>,
    validation: std::result::Result<(), garde::Report>,
}

impl ExternalDNSSpec {
    fn into_common(self) -> CommonSpec {
        let validation = self.validate();
        CommonSpec {
            validation,
            tenant_id: self.tenant_id,
            dns_zone_resource_ids: self.dns_zone_resource_ids,
            resource_types: self.resource_types,
            service_account: self.identity.service_account,
            gateway_label_filter: self
                .filters
                .as_ref()
                .and_then(|f| f.gateway_label_selector.clone()),
            route_and_ingress_label_filter: self
                .filters
                .as_ref()
                .and_then(|f| f.route_and_ingress_label_selector.clone()),
        }
    }
}

impl ClusterExternalDNSSpec {
    fn into_common(self) -> CommonSpec {
        let validation = self.validate();
        CommonSpec {
            validation,
            tenant_id: self.tenant_id,
            dns_zone_resource_ids: self.dns_zone_resource_ids,
            resource_types: self.resource_types,
            service_account: self.identity.service_account,
            gateway_label_filter: self
                .filters
                .as_ref()
                .and_then(|f| f.gateway_label_selector.clone()),
            route_and_ingress_label_filter: self
                .filters
                .as_ref()
                .and_then(|f| f.route_and_ingress_label_selector.clone()),
        }
    }
}

/// Small bridge so the user-error path can patch status on either CRD
/// without duplicating the flow.
#[allow(async_fn_in_trait)]
trait StatusConditions: Resource<DynamicType = ()> + Sized {
    fn status_or_default(&self) -> ExternalDNSStatus;
    async fn patch_own_status(&self, client: &Client, status: ExternalDNSStatus) -> Result<()>;
}

impl StatusConditions for ExternalDNS {
    fn status_or_default(&self) -> ExternalDNSStatus {
        self.status.clone().unwrap_or_default()
    }

    async fn patch_own_status(&self, client: &Client, status: ExternalDNSStatus) -> Result<()> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::missing_object_key("namespace"))?;
        patch_status(
            &Api::namespaced(client.clone(), &namespace),
            &self.name_any(),
            self.status.as_ref(),
            status,
            |status| ExternalDNS {
                metadata: ObjectMeta::default(),
                spec: ExternalDNSSpec::default(),
                status: Some(status),
            },
        )
        .await
    }
}

impl StatusConditions for ClusterExternalDNS {
    fn status_or_default(&self) -> ExternalDNSStatus {
        self.status.clone().unwrap_or_default()
    }

    async fn patch_own_status(&self, client: &Client, status: ExternalDNSStatus) -> Result<()> {
        patch_status(
            &Api::all(client.clone()),
            &self.name_any(),
            self.status.as_ref(),
            status,
            |status| ClusterExternalDNS {
                metadata: ObjectMeta::default(),
                spec: ClusterExternalDNSSpec::default(),
                status: Some(status),
            },
        )
        .await
    }
}

async fn patch_status<K, F>(
    api: &Api<K>,
    name: &str,
    current: Option<&ExternalDNSStatus>,
    status: ExternalDNSStatus,
    make_patch: F,
) -> Result<()>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    F: FnOnce(ExternalDNSStatus) -> K,
{
    if current == Some(&status) {
        return Ok(());
    }
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(make_patch(status)),
    )
    .await?;
    Ok(())
}
