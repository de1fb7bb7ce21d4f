use std::fmt::Debug;

use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Resource, ResourceExt as _,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{FIELD_MANAGER, FINALIZER};
use crate::Result;

/// Create-or-patch `desired`, preserving the server's resource version so a
/// concurrent writer surfaces as a 409 instead of being overwritten. A 409
/// is a requeue signal for the caller.
pub async fn upsert<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let current = api.get_opt(&desired.name_any()).await?;
    apply_over(api, desired, current).await
}

/// The resource-enforcer flavour of [`upsert`]: an object that is being
/// deleted is not resurrected mid-deletion. Instead the operator finalizer
/// is removed when present so the deletion can complete; the next cycle
/// recreates the object.
pub async fn enforce<K>(api: &Api<K>, desired: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = desired.name_any();
    let current = api.get_opt(&name).await?;
    if let Some(ref current) = current {
        if current.meta().deletion_timestamp.is_some() {
            if current.finalizers().iter().any(|f| f == FINALIZER) {
                debug!("removing finalizer from terminating object {name}");
                let remaining: Vec<&String> = current
                    .finalizers()
                    .iter()
                    .filter(|f| f.as_str() != FINALIZER)
                    .collect();
                api.patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(serde_json::json!({
                        "metadata": { "finalizers": remaining }
                    })),
                )
                .await?;
            }
            return Ok(());
        }
    }
    apply_over(api, desired, current).await?;
    Ok(())
}

async fn apply_over<K>(api: &Api<K>, desired: &K, current: Option<K>) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = desired.name_any();
    let Some(current) = current else {
        return Ok(api.create(&PostParams::default(), desired).await?);
    };
    let mut desired = desired.clone();
    desired.meta_mut().resource_version = current.meta().resource_version.clone();
    Ok(api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await?)
}
