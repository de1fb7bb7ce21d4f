mod customresource;
pub mod manifests;

use std::{sync::Arc, time::Duration};

pub use customresource::{
    DefaultSSLCertificate, ManagedObjectReference, NginxIngressController,
    NginxIngressControllerSpec, NginxIngressControllerStatus, Scaling, SecretReference,
    DEFAULT_CONTROLLER_NAME_PREFIX, MAX_NAME_LEN, MAX_PREFIX_LEN,
};
use futures::StreamExt as _;
use garde::Validate as _;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::Service,
    networking::v1::IngressClass,
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

use self::manifests::{
    derived_resource_name, nginx_ingress_resources, NginxIngressConfig, NginxIngressResources,
    DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS, DEFAULT_TARGET_CPU,
    NGINX_CONTROLLER_CLASS_PREFIX,
};
use super::{
    complete_reconcile, is_controller_owned_by, name::ControllerName, new_condition,
    spc::keyvault_secret_name, upsert, upsert_condition, KeyedMutex, ReconcileResult,
    FIELD_MANAGER,
};
use crate::{
    cli::ControllerArgs,
    error::UserError,
    metrics::Metrics,
    {Error, Result},
};

const CONDITION_AVAILABLE: &str = "Available";
const CONDITION_INGRESS_CLASS_READY: &str = "IngressClassReady";
const CONDITION_CONTROLLER_AVAILABLE: &str = "ControllerAvailable";
const CONDITION_PROGRESSING: &str = "Progressing";

/// The schema bounds the collision counter so a misbehaving environment
/// cannot chase an unbounded name space.
const MAX_COLLISIONS: i32 = 5;

const ENUMERATION_PERIOD: Duration = Duration::from_secs(5 * 60);

struct Context {
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    controller_name: ControllerName,
    recorder: Recorder,
    prefix_lock: KeyedMutex,
}

/// Runs the NginxIngressController controller until shutdown. A periodic
/// full enumeration reverts drift on inputs whose children were changed
/// behind the operator's back.
pub async fn run_controller(client: Client, args: ControllerArgs, metrics: Metrics) -> Result<()> {
    info!("Starting controller for NginxIngressController");
    let controller_name = ControllerName::new(&["nginx", "ingress", "controller"]);
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
        controller_name,
        prefix_lock: KeyedMutex::default(),
    });

    let api = Api::<NginxIngressController>::all(client.clone());
    let enumeration = futures::stream::unfold(
        tokio::time::interval(ENUMERATION_PERIOD),
        |mut interval| async move {
            interval.tick().await;
            Some(((), interval))
        },
    );

    Controller::new(api, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), Config::default())
        .owns(Api::<Service>::all(client.clone()), Config::default())
        .owns(Api::<IngressClass>::all(client), Config::default())
        .reconcile_all_on(enumeration)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller for NginxIngressController shutdown");
    Ok(())
}

async fn reconcile(nic: Arc<NginxIngressController>, ctx: Arc<Context>) -> Result<Action> {
    let result = ctx.reconcile_nic(&nic).await;
    complete_reconcile(&ctx.metrics, &ctx.controller_name, result)
}

fn error_policy(_: Arc<NginxIngressController>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    Action::requeue(Duration::from_secs(60))
}

/// What the collision walk found. The two collision kinds are independent:
/// a foreign IngressClass only blocks the class object (its name is fixed),
/// while the workload names keep walking the counter and the rest of the
/// managed set is still applied under the claimed name.
#[derive(Debug, PartialEq, Eq)]
struct CollisionOutcome {
    count: i32,
    ingress_class_blocked: bool,
    exhausted: bool,
}

/// Lookups the collision walk needs; the cluster-backed implementation
/// lives below, tests supply a canned one.
#[allow(async_fn_in_trait)]
trait ExistingObjects {
    async fn ingress_class(&self, name: &str) -> Result<Option<ObjectMeta>>;
    async fn deployment(&self, name: &str) -> Result<Option<ObjectMeta>>;
    async fn service(&self, name: &str) -> Result<Option<ObjectMeta>>;
}

struct ClusterCatalog<'a> {
    client: &'a Client,
    namespace: &'a str,
}

impl ExistingObjects for ClusterCatalog<'_> {
    async fn ingress_class(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let api = Api::<IngressClass>::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(|o| o.metadata))
    }

    async fn deployment(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), self.namespace);
        Ok(api.get_opt(name).await?.map(|o| o.metadata))
    }

    async fn service(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let api = Api::<Service>::namespaced(self.client.clone(), self.namespace);
        Ok(api.get_opt(name).await?.map(|o| o.metadata))
    }
}

/// Walks the candidate workload names until every derived Deployment and
/// Service is either absent or already owned by this input, and separately
/// checks the fixed-name IngressClass. The counter only ever grows, so two
/// inputs sharing a prefix settle on distinct names even while one of them
/// is blocked on its class.
async fn resolve_collisions(
    existing: &impl ExistingObjects,
    ingress_class_name: &str,
    prefix: &str,
    start: i32,
    uid: &str,
) -> Result<CollisionOutcome> {
    let ingress_class_blocked = match existing.ingress_class(ingress_class_name).await? {
        Some(meta) => !is_controller_owned_by(&meta, uid),
        None => false,
    };

    let foreign = |meta: Option<ObjectMeta>| {
        meta.is_some_and(|m| !is_controller_owned_by(&m, uid))
    };
    let mut count = start;
    let exhausted = loop {
        if count > MAX_COLLISIONS {
            break true;
        }
        let candidate = derived_resource_name(prefix, count);
        if !foreign(existing.deployment(&candidate).await?)
            && !foreign(existing.service(&candidate).await?)
        {
            break false;
        }
        count += 1;
    };

    Ok(CollisionOutcome {
        count,
        ingress_class_blocked,
        exhausted,
    })
}

impl Context {
    async fn reconcile_nic(&self, nic: &NginxIngressController) -> Result<ReconcileResult> {
        let name = nic.name_any();
        info!("Reconciling NginxIngressController \"{name}\"");

        if let Err(e) = self.validate(nic) {
            return self.handle_user_error(e, nic).await;
        }

        let prefix = nic.controller_name_prefix();
        let _guard = self.prefix_lock.lock(&prefix).await;

        let outcome = self.set_collision_count(nic).await?;
        if outcome.exhausted {
            let message = format!(
                "could not find a free name for prefix \"{prefix}\" within {MAX_COLLISIONS} attempts"
            );
            let mut status = nic.status.clone().unwrap_or_default();
            upsert_condition(
                status.conditions.get_or_insert_with(Vec::new),
                new_condition(
                    CONDITION_AVAILABLE,
                    false,
                    "Collision",
                    &message,
                    nic.metadata.generation,
                ),
            );
            self.patch_status(nic, status).await?;
            return Ok(ReconcileResult::success());
        }

        let cfg = self.nginx_config(nic, outcome.count);
        let owner = nic
            .controller_owner_ref(&())
            .ok_or_else(|| Error::missing_object_key("uid"))?;
        let resources = nginx_ingress_resources(&cfg, &owner);
        let managed_refs = self
            .apply(&cfg, &resources, !outcome.ingress_class_blocked)
            .await?;

        let deployment = Api::<Deployment>::namespaced(self.client.clone(), &cfg.namespace)
            .get_opt(&cfg.name)
            .await?;
        let status = self.build_status(nic, &outcome, managed_refs, deployment.as_ref());
        self.patch_status(nic, status).await?;
        Ok(ReconcileResult::success())
    }

    fn validate(&self, nic: &NginxIngressController) -> Result<()> {
        if nic.name_any().len() > MAX_NAME_LEN {
            return Err(UserError::from_msg(format!(
                "metadata.name must be at most {MAX_NAME_LEN} characters"
            ))
            .into());
        }
        if let Err(report) = nic.spec.validate() {
            return Err(UserError::new(
                format!("spec is invalid: {report}"),
                format!("garde validation failed: {report}"),
            )
            .into());
        }
        // Immutability is enforced against what the first reconcile
        // recorded; the schema's CEL rules are the first line of defence.
        if let Some(refs) = nic.status.as_ref().and_then(|s| s.managed_resource_refs.as_ref()) {
            if let Some(class_ref) = refs.iter().find(|r| r.kind == "IngressClass") {
                if class_ref.name != nic.ingress_class_name() {
                    return Err(UserError::from_msg(
                        "spec.ingressClassName is immutable",
                    )
                    .into());
                }
            }
            let prefix = nic.controller_name_prefix();
            if let Some(dep_ref) = refs.iter().find(|r| r.kind == "Deployment" && !r.name.ends_with("-default-backend")) {
                if !dep_ref.name.starts_with(&format!("{prefix}-")) {
                    return Err(UserError::from_msg(
                        "spec.controllerNamePrefix is immutable",
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Runs the collision walk against the cluster and persists the counter
    /// before anything is applied under the new name.
    async fn set_collision_count(
        &self,
        nic: &NginxIngressController,
    ) -> Result<CollisionOutcome> {
        let uid = nic.uid().ok_or_else(|| Error::missing_object_key("uid"))?;
        let catalog = ClusterCatalog {
            client: &self.client,
            namespace: self.args.operator_namespace(),
        };
        let start = nic.collision_count();
        let outcome = resolve_collisions(
            &catalog,
            &nic.ingress_class_name(),
            &nic.controller_name_prefix(),
            start,
            &uid,
        )
        .await?;

        if !outcome.exhausted && outcome.count != start {
            info!(
                "collision count for \"{}\" moved from {start} to {}",
                nic.name_any(),
                outcome.count
            );
            let mut status = nic.status.clone().unwrap_or_default();
            status.collision_count = Some(outcome.count);
            self.patch_status(nic, status).await?;
        }
        Ok(outcome)
    }

    fn nginx_config(&self, nic: &NginxIngressController, collision_count: i32) -> NginxIngressConfig {
        let name = derived_resource_name(&nic.controller_name_prefix(), collision_count);
        let namespace = self.args.operator_namespace().to_string();
        let (default_ssl_certificate, default_ssl_cert_spc) = match &nic.spec.default_ssl_certificate
        {
            Some(cert) if cert.key_vault_uri.is_some() => {
                let secret = keyvault_secret_name(&nic.name_any());
                (Some(format!("{namespace}/{secret}")), Some(secret))
            }
            Some(cert) => (
                cert.secret
                    .as_ref()
                    .map(|s| format!("{}/{}", s.namespace, s.name)),
                None,
            ),
            None => (None, None),
        };
        let scaling = nic.spec.scaling.clone().unwrap_or_default();

        NginxIngressConfig {
            controller_class: format!("{NGINX_CONTROLLER_CLASS_PREFIX}/{}", nic.name_any()),
            ingress_class_name: nic.ingress_class_name(),
            service_annotations: nic.spec.load_balancer_annotations.clone().unwrap_or_default(),
            default_ssl_certificate,
            default_ssl_cert_spc,
            default_backend_service: nic.spec.default_backend_service.clone(),
            force_ssl_redirect: nic
                .spec
                .default_ssl_certificate
                .as_ref()
                .and_then(|c| c.force_ssl_redirect)
                .unwrap_or(false),
            http_disabled: nic.spec.http_disabled.unwrap_or(false),
            custom_http_errors: nic.spec.custom_http_errors.clone().unwrap_or_default(),
            min_replicas: scaling.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS),
            max_replicas: scaling.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS),
            target_cpu_utilization_percentage: scaling
                .target_cpu_utilization_percentage
                .unwrap_or(DEFAULT_TARGET_CPU),
            enable_service_monitor: self.args.enable_service_monitor(),
            name,
            namespace,
        }
    }

    /// Upserts the managed set. A blocked IngressClass is skipped (never
    /// overwritten); everything else still applies so the input keeps its
    /// claim on the derived workload names.
    async fn apply(
        &self,
        cfg: &NginxIngressConfig,
        resources: &NginxIngressResources,
        include_ingress_class: bool,
    ) -> Result<Vec<ManagedObjectReference>> {
        let ns = &cfg.namespace;
        let mut refs = Vec::new();

        if include_ingress_class {
            upsert::upsert(&Api::all(self.client.clone()), &resources.ingress_class).await?;
            refs.push(object_ref("IngressClass", Some("networking.k8s.io"), &resources.ingress_class.metadata));
        }
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.service_account).await?;
        refs.push(object_ref("ServiceAccount", None, &resources.service_account.metadata));
        upsert::upsert(&Api::all(self.client.clone()), &resources.cluster_role).await?;
        refs.push(object_ref("ClusterRole", Some("rbac.authorization.k8s.io"), &resources.cluster_role.metadata));
        upsert::upsert(&Api::all(self.client.clone()), &resources.cluster_role_binding).await?;
        refs.push(object_ref("ClusterRoleBinding", Some("rbac.authorization.k8s.io"), &resources.cluster_role_binding.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.role).await?;
        refs.push(object_ref("Role", Some("rbac.authorization.k8s.io"), &resources.role.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.role_binding).await?;
        refs.push(object_ref("RoleBinding", Some("rbac.authorization.k8s.io"), &resources.role_binding.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.configmap).await?;
        refs.push(object_ref("ConfigMap", None, &resources.configmap.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.deployment).await?;
        refs.push(object_ref("Deployment", Some("apps"), &resources.deployment.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.service).await?;
        refs.push(object_ref("Service", None, &resources.service.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.hpa).await?;
        refs.push(object_ref("HorizontalPodAutoscaler", Some("autoscaling"), &resources.hpa.metadata));
        upsert::upsert(&Api::namespaced(self.client.clone(), ns), &resources.pdb).await?;
        refs.push(object_ref("PodDisruptionBudget", Some("policy"), &resources.pdb.metadata));
        if let Some(deployment) = &resources.default_backend_deployment {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), deployment).await?;
            refs.push(object_ref("Deployment", Some("apps"), &deployment.metadata));
        }
        if let Some(service) = &resources.default_backend_service {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), service).await?;
            refs.push(object_ref("Service", None, &service.metadata));
        }
        if let Some(monitor) = &resources.service_monitor {
            upsert::upsert(&Api::namespaced(self.client.clone(), ns), monitor).await?;
            refs.push(object_ref("ServiceMonitor", Some("monitoring.coreos.com"), &monitor.metadata));
        }
        Ok(refs)
    }

    fn build_status(
        &self,
        nic: &NginxIngressController,
        outcome: &CollisionOutcome,
        managed_refs: Vec<ManagedObjectReference>,
        deployment: Option<&Deployment>,
    ) -> NginxIngressControllerStatus {
        let generation = nic.metadata.generation;
        let mut status = nic.status.clone().unwrap_or_default();
        status.collision_count = Some(outcome.count);
        status.managed_resource_refs = Some(managed_refs);

        let deployment_status = deployment.and_then(|d| d.status.as_ref());
        status.controller_replicas = deployment_status.and_then(|s| s.replicas);
        status.controller_ready_replicas = deployment_status.and_then(|s| s.ready_replicas);
        status.controller_available_replicas =
            deployment_status.and_then(|s| s.available_replicas);
        status.controller_unavailable_replicas =
            deployment_status.and_then(|s| s.unavailable_replicas);

        let deployment_condition = |type_: &str| {
            deployment_status
                .and_then(|s| s.conditions.as_ref())
                .into_iter()
                .flatten()
                .find(|c| c.type_ == type_)
                .map(|c| c.status == "True")
        };
        let controller_available = deployment_condition("Available").unwrap_or(false);
        let progressing = deployment_condition("Progressing").unwrap_or(true);
        let class_blocked = outcome.ingress_class_blocked;

        let conditions = status.conditions.get_or_insert_with(Vec::new);
        if class_blocked {
            upsert_condition(
                conditions,
                new_condition(
                    CONDITION_INGRESS_CLASS_READY,
                    false,
                    "Collision",
                    &format!(
                        "IngressClass \"{}\" already exists and is not managed by this resource",
                        nic.ingress_class_name()
                    ),
                    generation,
                ),
            );
        } else {
            upsert_condition(
                conditions,
                new_condition(
                    CONDITION_INGRESS_CLASS_READY,
                    true,
                    "IngressClassApplied",
                    "the IngressClass is applied and claimed",
                    generation,
                ),
            );
        }
        upsert_condition(
            conditions,
            new_condition(
                CONDITION_CONTROLLER_AVAILABLE,
                controller_available,
                if controller_available {
                    "ControllerAvailable"
                } else {
                    "ControllerUnavailable"
                },
                "derived from the controller Deployment's Available condition",
                generation,
            ),
        );
        upsert_condition(
            conditions,
            new_condition(
                CONDITION_PROGRESSING,
                progressing,
                "DeploymentRollout",
                "derived from the controller Deployment's Progressing condition",
                generation,
            ),
        );
        let available = controller_available && !class_blocked;
        upsert_condition(
            conditions,
            new_condition(
                CONDITION_AVAILABLE,
                available,
                if class_blocked {
                    "Collision"
                } else if controller_available {
                    "ControllerReady"
                } else {
                    "ControllerUnavailable"
                },
                "ingress controller and ingress class availability",
                generation,
            ),
        );
        status
    }

    async fn patch_status(
        &self,
        nic: &NginxIngressController,
        status: NginxIngressControllerStatus,
    ) -> Result<()> {
        if nic.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let api = Api::<NginxIngressController>::all(self.client.clone());
        api.patch_status(
            &nic.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(NginxIngressController {
                metadata: ObjectMeta::default(),
                spec: NginxIngressControllerSpec::default(),
                status: Some(status),
            }),
        )
        .await?;
        Ok(())
    }

    async fn handle_user_error(
        &self,
        error: Error,
        nic: &NginxIngressController,
    ) -> Result<ReconcileResult> {
        let Some(user) = error.as_user_error() else {
            return Err(error);
        };
        warn!(
            "invalid NginxIngressController \"{}\": {}",
            nic.name_any(),
            user.dev_message()
        );
        let event = Event {
            type_: EventType::Warning,
            reason: "InvalidInput".to_string(),
            note: Some(user.user_message().to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &nic.object_ref(&())).await {
            warn!("publishing InvalidInput event failed: {e}");
        }

        let mut status = nic.status.clone().unwrap_or_default();
        upsert_condition(
            status.conditions.get_or_insert_with(Vec::new),
            new_condition(
                CONDITION_AVAILABLE,
                false,
                "InvalidInput",
                user.user_message(),
                nic.metadata.generation,
            ),
        );
        self.patch_status(nic, status).await?;
        Ok(ReconcileResult::success())
    }
}

fn object_ref(kind: &str, api_group: Option<&str>, meta: &ObjectMeta) -> ManagedObjectReference {
    ManagedObjectReference {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone(),
        kind: kind.to_string(),
        api_group: api_group.map(str::to_string),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    #[derive(Default)]
    struct FakeCluster {
        ingress_classes: HashMap<String, ObjectMeta>,
        deployments: HashMap<String, ObjectMeta>,
        services: HashMap<String, ObjectMeta>,
    }

    impl ExistingObjects for FakeCluster {
        async fn ingress_class(&self, name: &str) -> Result<Option<ObjectMeta>> {
            Ok(self.ingress_classes.get(name).cloned())
        }

        async fn deployment(&self, name: &str) -> Result<Option<ObjectMeta>> {
            Ok(self.deployments.get(name).cloned())
        }

        async fn service(&self, name: &str) -> Result<Option<ObjectMeta>> {
            Ok(self.services.get(name).cloned())
        }
    }

    fn owned_meta(uid: &str) -> ObjectMeta {
        ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "approuting.kubernetes.azure.com/v1alpha1".to_string(),
                kind: "NginxIngressController".to_string(),
                name: "owner".to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn claim(cluster: &mut FakeCluster, name: &str, uid: &str) {
        cluster
            .deployments
            .insert(name.to_string(), owned_meta(uid));
        cluster.services.insert(name.to_string(), owned_meta(uid));
    }

    #[tokio::test]
    async fn blocked_ingress_class_still_claims_distinct_workload_names() {
        let mut cluster = FakeCluster::default();
        // A user-authored IngressClass occupies A's fixed class name.
        cluster
            .ingress_classes
            .insert("existing".to_string(), ObjectMeta::default());

        let a = resolve_collisions(&cluster, "existing", "nginx", 0, "uid-a")
            .await
            .unwrap();
        assert!(a.ingress_class_blocked);
        assert!(!a.exhausted);
        assert_eq!(a.count, 0);

        // A keeps reconciling its workloads despite the blocked class, so
        // its derived objects exist by the time B arrives with the same
        // prefix.
        claim(&mut cluster, &derived_resource_name("nginx", a.count), "uid-a");

        let b = resolve_collisions(&cluster, "new", "nginx", 0, "uid-b")
            .await
            .unwrap();
        assert!(!b.ingress_class_blocked);
        assert!(!b.exhausted);
        assert_eq!(b.count, 1);
        assert_ne!(
            derived_resource_name("nginx", a.count),
            derived_resource_name("nginx", b.count)
        );
    }

    #[tokio::test]
    async fn the_owner_keeps_its_count_across_reconciles() {
        let mut cluster = FakeCluster::default();
        claim(&mut cluster, "nginx-0", "uid-a");
        cluster
            .ingress_classes
            .insert("webapp".to_string(), owned_meta("uid-a"));

        let again = resolve_collisions(&cluster, "webapp", "nginx", 0, "uid-a")
            .await
            .unwrap();
        assert_eq!(
            again,
            CollisionOutcome {
                count: 0,
                ingress_class_blocked: false,
                exhausted: false,
            }
        );
    }

    #[tokio::test]
    async fn a_foreign_service_alone_bumps_the_count() {
        let mut cluster = FakeCluster::default();
        cluster
            .services
            .insert("nginx-0".to_string(), owned_meta("uid-other"));

        let outcome = resolve_collisions(&cluster, "webapp", "nginx", 0, "uid-a")
            .await
            .unwrap();
        assert_eq!(outcome.count, 1);
        assert!(!outcome.ingress_class_blocked);
    }

    #[tokio::test]
    async fn the_counter_is_bounded() {
        let mut cluster = FakeCluster::default();
        for count in 0..=MAX_COLLISIONS {
            claim(
                &mut cluster,
                &derived_resource_name("nginx", count),
                "uid-other",
            );
        }

        let outcome = resolve_collisions(&cluster, "webapp", "nginx", 0, "uid-a")
            .await
            .unwrap();
        assert!(outcome.exhausted);
    }
}
