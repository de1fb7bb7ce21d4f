pub mod defaultcert;
pub mod externaldns;
pub mod name;
pub mod nginx;
pub mod resources;
pub mod spc;
pub mod upsert;
pub mod watchdog;

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    time::Duration,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{api::ObjectMeta, runtime::controller::Action};

use crate::{
    metrics::Metrics,
    {Error, Result},
};

pub const OPERATOR_NAME: &str = "app-routing-operator";
pub const FIELD_MANAGER: &str = "approuting.kubernetes.azure.com";
pub const FINALIZER: &str = "approuting.kubernetes.azure.com/finalizer";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// The label set stamped on every object this operator manages. Deletion
/// paths require it before touching anything.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string())])
}

pub fn is_operator_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == OPERATOR_NAME)
}

/// True when `meta` carries a controller owner reference pointing at the
/// object with the given uid.
pub fn is_controller_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .into_iter()
        .flatten()
        .any(|o| o.controller.unwrap_or(false) && o.uid == owner_uid)
}

/// Contract-level outcome of one reconciliation pass. Distinguishes the
/// three shapes the metrics registry and the work queue care about:
/// immediate success, immediate retry, and delayed retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn after(d: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(d),
        }
    }

    pub fn into_action(self) -> Action {
        if let Some(d) = self.requeue_after {
            Action::requeue(d)
        } else if self.requeue {
            Action::requeue(Duration::ZERO)
        } else {
            Action::await_change()
        }
    }
}

/// Closes one reconciliation: conflicts become an immediate requeue, the
/// outcome is counted exactly once, and a vanished primary input is
/// success.
pub fn complete_reconcile(
    metrics: &Metrics,
    controller: &name::ControllerName,
    result: Result<ReconcileResult, Error>,
) -> Result<Action, Error> {
    let result = match result {
        Err(e) if e.is_conflict() => Ok(ReconcileResult::requeue_now()),
        other => other,
    };
    metrics.reconcile.observe(controller, &result);
    match result {
        Ok(r) => Ok(r.into_action()),
        Err(e) if e.is_not_found() => Ok(ReconcileResult::success().into_action()),
        Err(e) => Err(e),
    }
}

pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(k8s_openapi::jiff::Timestamp::now()),
    }
}

/// Replaces or appends a condition by type. The transition time only moves
/// when the status flips, following the apimachinery convention.
pub fn upsert_condition(list: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = list.iter_mut().find(|c| c.type_ == cond.type_) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = cond;
    } else {
        list.push(cond);
    }
}

/// Mutex keyed by string into a fixed set of hash buckets. Two keys landing
/// in the same bucket serialise against each other, which is acceptable at
/// the expected cardinality; a single global lock is not.
pub struct KeyedMutex {
    buckets: Vec<tokio::sync::Mutex<()>>,
}

impl KeyedMutex {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        self.buckets[idx].lock().await
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reconcile_result_maps_to_actions() {
        assert_eq!(
            format!("{:?}", ReconcileResult::success().into_action()),
            format!("{:?}", Action::await_change())
        );
        assert_eq!(
            format!("{:?}", ReconcileResult::requeue_now().into_action()),
            format!("{:?}", Action::requeue(Duration::ZERO))
        );
        assert_eq!(
            format!("{:?}", ReconcileResult::after(Duration::from_secs(30)).into_action()),
            format!("{:?}", Action::requeue(Duration::from_secs(30)))
        );
    }

    #[test]
    fn managed_marker_round_trips() {
        let meta = ObjectMeta {
            labels: Some(managed_labels()),
            ..Default::default()
        };
        assert!(is_operator_managed(&meta));
        assert!(!is_operator_managed(&ObjectMeta::default()));
    }

    #[test]
    fn condition_transition_time_moves_only_on_status_flips() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            new_condition("Available", true, "Deployed", "all good", Some(1)),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        upsert_condition(
            &mut conditions,
            new_condition("Available", true, "Deployed", "still good", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].observed_generation, Some(2));

        upsert_condition(
            &mut conditions,
            new_condition("Progressing", false, "Settled", "", Some(2)),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[tokio::test]
    async fn keyed_mutex_serialises_one_key() {
        let mutex = KeyedMutex::default();
        let first = mutex.lock("nginx").await;
        assert!(mutex.buckets.len() == 10);
        // A different key may or may not share the bucket; the same key
        // must block.
        assert!(tokio::time::timeout(Duration::from_millis(20), mutex.lock("nginx"))
            .await
            .is_err());
        drop(first);
        assert!(tokio::time::timeout(Duration::from_millis(20), mutex.lock("nginx"))
            .await
            .is_ok());
    }
}
