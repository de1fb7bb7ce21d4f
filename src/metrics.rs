use std::sync::Arc;

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

use crate::{
    controllers::{name::ControllerName, ReconcileResult},
    error::ControllerError,
};

const RESULT_SUCCESS: &str = "success";
const RESULT_ERROR: &str = "error";
const RESULT_REQUEUE: &str = "requeue";
const RESULT_REQUEUE_AFTER: &str = "requeue_after";

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub keyvault: KeyvaultMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("app_routing_operator");
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let keyvault = KeyvaultMetrics::default().register(&mut registry);
        Self {
            reconcile,
            keyvault,
            registry: Arc::new(registry),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub controller: String,
}

#[derive(Clone, Default)]
pub struct ReconcileMetrics {
    total: Family<ReconcileLabels, Counter>,
    errors: Family<ControllerLabels, Counter>,
}

impl ReconcileMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register("reconcile", "reconciliation outcomes", self.total.clone());
        r.register(
            "reconcile_errors",
            "reconciliation errors",
            self.errors.clone(),
        );
        self
    }

    /// Touches every bucket for the controller so scrapers see explicit
    /// zeroes instead of absent series.
    pub fn init_controller(&self, name: &ControllerName) {
        let controller = name.metrics_name();
        for result in [
            RESULT_SUCCESS,
            RESULT_ERROR,
            RESULT_REQUEUE,
            RESULT_REQUEUE_AFTER,
        ] {
            self.total.get_or_create(&ReconcileLabels {
                controller: controller.clone(),
                result: result.to_string(),
            });
        }
        self.errors.get_or_create(&ControllerLabels { controller });
    }

    /// Records exactly one outcome for a completed reconciliation. An
    /// orchestrator "not found" on the primary input counts as nothing at
    /// all.
    pub fn observe(
        &self,
        name: &ControllerName,
        outcome: &Result<ReconcileResult, ControllerError>,
    ) {
        let controller = name.metrics_name();
        let result = match outcome {
            Err(e) if e.is_not_found() => return,
            Err(_) => {
                self.errors
                    .get_or_create(&ControllerLabels {
                        controller: controller.clone(),
                    })
                    .inc();
                RESULT_ERROR
            }
            Ok(r) if r.requeue_after.is_some() => RESULT_REQUEUE_AFTER,
            Ok(r) if r.requeue => RESULT_REQUEUE,
            Ok(_) => RESULT_SUCCESS,
        };
        self.total
            .get_or_create(&ReconcileLabels {
                controller,
                result: result.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    fn get(&self, name: &ControllerName, result: &str) -> u64 {
        self.total
            .get_or_create(&ReconcileLabels {
                controller: name.metrics_name(),
                result: result.to_string(),
            })
            .get()
    }

    #[cfg(test)]
    fn errors_for(&self, name: &ControllerName) -> u64 {
        self.errors
            .get_or_create(&ControllerLabels {
                controller: name.metrics_name(),
            })
            .get()
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub result: String,
}

#[derive(Clone, Default)]
pub struct KeyvaultMetrics {
    fetches: Family<FetchLabels, Counter>,
    errors: Counter,
}

impl KeyvaultMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register(
            "keyvault_fetch",
            "keyvault certificate fetch outcomes",
            self.fetches.clone(),
        );
        r.register(
            "keyvault_fetch_errors",
            "keyvault certificate fetch errors",
            self.errors.clone(),
        );
        self
    }

    fn record(&self, result: &str) {
        self.fetches
            .get_or_create(&FetchLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_success(&self) {
        self.record(RESULT_SUCCESS);
    }

    pub fn record_error(&self) {
        self.record(RESULT_ERROR);
        self.errors.inc();
    }

    pub fn record_not_found(&self) {
        self.record("not_found");
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn not_found() -> ControllerError {
        ControllerError::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: "NotFound".into(),
            code: 404,
        }))
    }

    #[test]
    fn outcome_mapping_matches_the_table() {
        let metrics = Metrics::default();
        let name = ControllerName::new(&["test", "mapping"]);
        metrics.reconcile.init_controller(&name);

        metrics
            .reconcile
            .observe(&name, &Ok(ReconcileResult::success()));
        assert_eq!(metrics.reconcile.get(&name, RESULT_SUCCESS), 1);

        metrics
            .reconcile
            .observe(&name, &Ok(ReconcileResult::requeue_now()));
        assert_eq!(metrics.reconcile.get(&name, RESULT_REQUEUE), 1);

        metrics
            .reconcile
            .observe(&name, &Ok(ReconcileResult::after(Duration::from_secs(5))));
        assert_eq!(metrics.reconcile.get(&name, RESULT_REQUEUE_AFTER), 1);

        metrics
            .reconcile
            .observe(&name, &Err(ControllerError::metric_not_found()));
        assert_eq!(metrics.reconcile.get(&name, RESULT_ERROR), 1);
        assert_eq!(metrics.reconcile.errors_for(&name), 1);
    }

    #[test]
    fn not_found_counts_nothing() {
        let metrics = Metrics::default();
        let name = ControllerName::new(&["test", "notfound"]);
        metrics.reconcile.init_controller(&name);
        metrics.reconcile.observe(&name, &Err(not_found()));
        for result in [RESULT_SUCCESS, RESULT_ERROR, RESULT_REQUEUE, RESULT_REQUEUE_AFTER] {
            assert_eq!(metrics.reconcile.get(&name, result), 0);
        }
        assert_eq!(metrics.reconcile.errors_for(&name), 0);
    }

    #[test]
    fn buckets_render_as_zero_after_registration() {
        let metrics = Metrics::default();
        let name = ControllerName::new(&["fresh"]);
        metrics.reconcile.init_controller(&name);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();
        for result in [RESULT_SUCCESS, RESULT_ERROR, RESULT_REQUEUE, RESULT_REQUEUE_AFTER] {
            let line = format!("controller=\"fresh\",result=\"{result}\"");
            assert!(buffer.contains(&line), "missing series for {result}: {buffer}");
        }
    }
}
