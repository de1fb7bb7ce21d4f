use std::time::Duration;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{api::ObjectMeta, Api, Client, ResourceExt as _};
use rand::Rng as _;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{
    externaldns::{
        manifests::{external_dns_resources, ExternalDnsConfig, IdentityMode, ResourceType},
        zones::partition_zones,
    },
    managed_labels,
    name::ControllerName,
    upsert, ReconcileResult, FINALIZER,
};
use crate::{cli::ControllerArgs, metrics::Metrics, Error, Result};

/// Relative jitter applied to every enforcement cycle so replicas that
/// took leadership at the same moment spread their API load.
const CYCLE_JITTER_RATIO: f64 = 0.3;

/// One statically-enforced object. The list is fixed at startup from the
/// operator configuration; the cycle recreates anything that vanished.
pub enum EnforcedResource {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    Deployment(Deployment),
}

impl EnforcedResource {
    pub fn describe(&self) -> String {
        match self {
            EnforcedResource::Namespace(o) => format!("Namespace/{}", o.name_any()),
            EnforcedResource::ServiceAccount(o) => format!("ServiceAccount/{}", o.name_any()),
            EnforcedResource::ClusterRole(o) => format!("ClusterRole/{}", o.name_any()),
            EnforcedResource::ClusterRoleBinding(o) => {
                format!("ClusterRoleBinding/{}", o.name_any())
            }
            EnforcedResource::ConfigMap(o) => format!("ConfigMap/{}", o.name_any()),
            EnforcedResource::Deployment(o) => format!("Deployment/{}", o.name_any()),
        }
    }

    async fn enforce(&self, client: &Client) -> Result<()> {
        match self {
            EnforcedResource::Namespace(o) => upsert::enforce(&Api::all(client.clone()), o).await,
            EnforcedResource::ServiceAccount(o) => {
                upsert::enforce(&namespaced_api(client, o)?, o).await
            }
            EnforcedResource::ClusterRole(o) => upsert::enforce(&Api::all(client.clone()), o).await,
            EnforcedResource::ClusterRoleBinding(o) => {
                upsert::enforce(&Api::all(client.clone()), o).await
            }
            EnforcedResource::ConfigMap(o) => upsert::enforce(&namespaced_api(client, o)?, o).await,
            EnforcedResource::Deployment(o) => {
                upsert::enforce(&namespaced_api(client, o)?, o).await
            }
        }
    }
}

fn namespaced_api<K>(client: &Client, obj: &K) -> Result<Api<K>>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::missing_object_key("namespace"))?;
    Ok(Api::namespaced(client.clone(), &namespace))
}

/// The static object list for this configuration: the operator namespace
/// plus one externalDNS instance per zone kind, when a managed identity is
/// available to run them with.
pub fn static_resources(args: &ControllerArgs) -> Result<Vec<EnforcedResource>> {
    let mut resources = vec![EnforcedResource::Namespace(operator_namespace(args))];

    let Some(client_id) = args.msi_client_id() else {
        if !args.dns_zone_ids().is_empty() {
            warn!("DNS zones are configured but no managed identity is; skipping externalDNS");
        }
        return Ok(resources);
    };

    for zones in partition_zones(args.dns_zone_ids())? {
        let cfg = ExternalDnsConfig {
            tenant_id: args.tenant_id().to_string(),
            cluster_uid: args.cluster_uid().to_string(),
            cloud: args.cloud().to_string(),
            location: args.location().cloned(),
            namespace: args.operator_namespace().to_string(),
            zones,
            resource_types: vec![ResourceType::Ingress],
            identity: IdentityMode::ManagedIdentity {
                client_id: client_id.clone(),
            },
            sync_interval_seconds: args.dns_sync_interval_seconds(),
            namespace_limited: false,
            gateway_label_filter: None,
            route_and_ingress_label_filter: None,
        };
        let set = external_dns_resources(&cfg, None)?;
        if let Some(sa) = set.service_account {
            resources.push(EnforcedResource::ServiceAccount(sa));
        }
        if let Some(role) = set.cluster_role {
            resources.push(EnforcedResource::ClusterRole(role));
        }
        if let Some(binding) = set.cluster_role_binding {
            resources.push(EnforcedResource::ClusterRoleBinding(binding));
        }
        resources.push(EnforcedResource::ConfigMap(set.configmap));
        resources.push(EnforcedResource::Deployment(set.deployment));
    }
    Ok(resources)
}

fn operator_namespace(args: &ControllerArgs) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(args.operator_namespace().to_string()),
            labels: Some(managed_labels()),
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Timer-driven enforcement loop. Leader-only; exits on shutdown.
pub async fn run(
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let controller_name = ControllerName::new(&["resource", "reconciler"]);
    metrics.reconcile.init_controller(&controller_name);
    let resources = static_resources(&args)?;
    info!(
        "Starting resource reconciler enforcing {} objects",
        resources.len()
    );

    let period = Duration::from_secs(args.resource_enforcer_interval_seconds());
    loop {
        let outcome = enforce_all(&client, &resources).await;
        metrics.reconcile.observe(&controller_name, &outcome);
        if let Err(e) = outcome {
            warn!("resource enforcement cycle failed: {e}");
        }

        let jitter = rand::thread_rng()
            .gen_range((1.0 - CYCLE_JITTER_RATIO)..=(1.0 + CYCLE_JITTER_RATIO));
        tokio::select! {
            _ = tokio::time::sleep(period.mul_f64(jitter)) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("resource reconciler shutdown");
    Ok(())
}

/// One cycle over the whole list. Later objects are still enforced when an
/// earlier one fails; the cycle reports the first error.
async fn enforce_all(
    client: &Client,
    resources: &[EnforcedResource],
) -> Result<ReconcileResult> {
    let mut first_error = None;
    for resource in resources {
        if let Err(e) = resource.enforce(client).await {
            warn!("enforcing {} failed: {e}", resource.describe());
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(ReconcileResult::success()),
    }
}

#[cfg(test)]
mod test {
    use clap::Parser as _;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn args(extra: &[&str]) -> ControllerArgs {
        let mut argv = vec![
            "operator",
            "run",
            "--cluster-uid",
            "uid-1",
            "--tenant-id",
            "2c105d52-8af5-4f5e-9d24-5c5ea0cbcee7",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().commands() {
            Commands::Run(args) => args.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn namespace_is_always_enforced() {
        let resources = static_resources(&args(&[])).unwrap();
        assert_eq!(resources.len(), 1);
        assert!(matches!(resources[0], EnforcedResource::Namespace(_)));
        let EnforcedResource::Namespace(ns) = &resources[0] else {
            unreachable!()
        };
        assert_eq!(ns.name_any(), "app-routing-system");
        assert!(ns
            .metadata
            .finalizers
            .as_ref()
            .unwrap()
            .contains(&FINALIZER.to_string()));
    }

    #[test]
    fn dns_zones_with_identity_yield_external_dns_sets() {
        let resources = static_resources(&args(&[
            "--msi-client-id",
            "client-1",
            "--dns-zone-id",
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/dnszones/a.com",
            "--dns-zone-id",
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/privatednszones/b.internal",
        ]))
        .unwrap();
        // Namespace + (sa, clusterrole, binding, configmap, deployment) per kind.
        assert_eq!(resources.len(), 11);
        let deployments: Vec<String> = resources
            .iter()
            .filter_map(|r| match r {
                EnforcedResource::Deployment(d) => Some(d.name_any()),
                _ => None,
            })
            .collect();
        assert_eq!(deployments, ["external-dns", "external-dns-private"]);
    }

    #[test]
    fn dns_zones_without_identity_are_skipped() {
        let resources = static_resources(&args(&[
            "--dns-zone-id",
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/dnszones/a.com",
        ]))
        .unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn malformed_zone_ids_fail_at_startup() {
        assert!(static_resources(&args(&[
            "--msi-client-id",
            "client-1",
            "--dns-zone-id",
            "not-a-resource-id",
        ]))
        .is_err());
    }
}
