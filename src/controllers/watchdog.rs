use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{EvictParams, ListParams},
    Api, Client, ResourceExt as _,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::nginx::{manifests::derived_resource_name, NginxIngressController};
use crate::{Error, Result};

const ACTIVE_CONNECTIONS_METRIC: &str = "nginx_ingress_controller_nginx_process_connections";

/// Fewer ready pods than this and the mean is not representative enough to
/// single anyone out.
const MIN_PODS_FOR_VOTE: usize = 3;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub tick: Duration,
    pub min_pod_age: Duration,
    pub vote_ttl: Duration,
    pub min_votes_before_eviction: usize,
    pub min_percent_over_avg: f64,
    pub ring_capacity: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            min_pod_age: Duration::from_secs(60),
            vote_ttl: Duration::from_secs(60),
            min_votes_before_eviction: 4,
            min_percent_over_avg: 200.0,
            ring_capacity: 20,
        }
    }
}

/// One scrape target: a labelled pod set exposing the nginx metrics port.
#[derive(Debug, Clone)]
pub struct WatchdogTarget {
    pub name: String,
    pub namespace: String,
    pub label_selector: String,
    pub metrics_port: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvictionVote {
    pub pod_name: String,
    pub time: Instant,
}

/// Fixed-capacity ring of votes; casting overwrites the oldest slot, so a
/// pod that briefly misbehaved ages out on its own. The TTL guards against
/// clocks not aligned to the tick cadence.
#[derive(Debug)]
pub struct VoteRing {
    slots: Vec<Option<EvictionVote>>,
    next: usize,
}

impl VoteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    pub fn cast(&mut self, vote: EvictionVote) {
        let len = self.slots.len();
        self.slots[self.next] = Some(vote);
        self.next = (self.next + 1) % len;
    }

    pub fn purge_expired(&mut self, now: Instant, ttl: Duration) {
        for slot in &mut self.slots {
            if slot
                .as_ref()
                .is_some_and(|v| now.duration_since(v.time) > ttl)
            {
                *slot = None;
            }
        }
    }

    pub fn tally(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for vote in self.slots.iter().flatten() {
            *counts.entry(vote.pod_name.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear_pod(&mut self, pod_name: &str) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|v| v.pod_name == pod_name) {
                *slot = None;
            }
        }
    }
}

/// Index of the pod whose count is anomalously above the mean, if any.
fn select_overloaded(connections: &[f64], min_percent_over_avg: f64) -> Option<usize> {
    if connections.is_empty() {
        return None;
    }
    let mean = connections.iter().sum::<f64>() / connections.len() as f64;
    let (max_idx, max) = connections
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |(best_idx, best), (idx, &c)| {
            if c > best {
                (idx, c)
            } else {
                (best_idx, best)
            }
        });
    (max >= mean * (min_percent_over_avg / 100.0)).then_some(max_idx)
}

/// Extracts the active-connection gauge from a Prometheus exposition body.
fn parse_active_connections(body: &str) -> Result<f64> {
    for line in body.lines() {
        let line = line.trim();
        if !line.starts_with(ACTIVE_CONNECTIONS_METRIC) || !line.contains(r#"state="active""#) {
            continue;
        }
        if let Some(value) = line.rsplit(' ').next() {
            if let Ok(parsed) = value.parse::<f64>() {
                return Ok(parsed);
            }
        }
    }
    Err(Error::metric_not_found())
}

/// Pods eligible for scraping: every Ready condition True and old enough
/// that startup churn does not look like an anomaly.
fn eligible_pods(pods: Vec<Pod>, now: DateTime<Utc>, min_age: Duration) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            let ready_conditions: Vec<_> = pod
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .into_iter()
                .flatten()
                .filter(|c| c.type_ == "Ready")
                .collect();
            if ready_conditions.is_empty()
                || !ready_conditions.iter().all(|c| c.status == "True")
            {
                return false;
            }
            pod.creation_timestamp()
                .is_some_and(|t| {
                    let created: DateTime<Utc> = std::time::SystemTime::from(t.0).into();
                    now.signed_duration_since(created).to_std().unwrap_or_default() > min_age
                })
        })
        .collect()
}

/// Pods with a sustained quorum of recent votes that are still present in
/// the listing. A vote for a pod that vanished keeps occupying its slot
/// until overwritten, it just never reaches quorum.
fn ready_for_eviction(
    ring: &mut VoteRing,
    now: Instant,
    config: &WatchdogConfig,
    present: &[String],
) -> Vec<String> {
    ring.purge_expired(now, config.vote_ttl);
    let candidates: Vec<String> = ring
        .tally()
        .into_iter()
        .filter(|(pod, count)| {
            *count >= config.min_votes_before_eviction && present.iter().any(|p| p == pod)
        })
        .map(|(pod, _)| pod.to_string())
        .collect();
    for pod in &candidates {
        ring.clear_pod(pod);
    }
    candidates
}

pub struct Watchdog {
    client: Client,
    config: WatchdogConfig,
    /// Namespace the managed ingress controllers live in.
    workload_namespace: String,
    ring: VoteRing,
}

impl Watchdog {
    pub fn new(client: Client, config: WatchdogConfig, workload_namespace: String) -> Self {
        let ring = VoteRing::new(config.ring_capacity);
        Self {
            client,
            config,
            workload_namespace,
            ring,
        }
    }

    /// One target per NginxIngressController input, labelled like its
    /// derived deployment.
    async fn discover_targets(&self) -> Result<Vec<WatchdogTarget>> {
        let api = Api::<NginxIngressController>::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .map(|nic| {
                let resource_name =
                    derived_resource_name(&nic.controller_name_prefix(), nic.collision_count());
                WatchdogTarget {
                    name: nic.name_any(),
                    namespace: self.workload_namespace.clone(),
                    label_selector: format!("app={resource_name}"),
                    metrics_port: 10254,
                }
            })
            .collect())
    }

    /// Leader-only loop; exits when the shutdown channel flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting concurrency watchdog");
        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("concurrency watchdog shutdown");
    }

    async fn tick(&mut self) {
        let targets = match self.discover_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!("watchdog target discovery failed: {e}");
                return;
            }
        };
        for target in &targets {
            if let Err(e) = self.process_target(target).await {
                warn!("watchdog target {} skipped: {e}", target.name);
            }
        }
    }

    async fn process_target(&mut self, target: &WatchdogTarget) -> Result<()> {
        let pod_api = Api::<Pod>::namespaced(self.client.clone(), &target.namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&target.label_selector))
            .await?
            .items;
        let pods = eligible_pods(pods, Utc::now(), self.config.min_pod_age);
        if pods.len() < MIN_PODS_FOR_VOTE {
            debug!(
                "watchdog target {} has {} eligible pods, not enough for a representative mean",
                target.name,
                pods.len()
            );
            return Ok(());
        }

        let mut connections = Vec::with_capacity(pods.len());
        for pod in &pods {
            connections.push(self.scrape(target, &pod.name_any()).await?);
        }

        let now = Instant::now();
        if let Some(idx) = select_overloaded(&connections, self.config.min_percent_over_avg) {
            let pod_name = pods[idx].name_any();
            debug!(
                "watchdog vote for {pod_name}: {} active connections against a mean of {:.1}",
                connections[idx],
                connections.iter().sum::<f64>() / connections.len() as f64
            );
            self.ring.cast(EvictionVote {
                pod_name,
                time: now,
            });
        }

        let present: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        for pod in ready_for_eviction(&mut self.ring, now, &self.config, &present) {
            info!("watchdog evicting pod {pod} after sustained vote quorum");
            // Eviction is advisory; the orchestrator may refuse it to honor
            // a disruption budget.
            if let Err(e) = pod_api.evict(&pod, &EvictParams::default()).await {
                warn!("eviction of {pod} refused: {e}");
            }
        }
        Ok(())
    }

    async fn scrape(&self, target: &WatchdogTarget, pod_name: &str) -> Result<f64> {
        let path = format!(
            "/api/v1/namespaces/{}/pods/{}:{}/proxy/metrics",
            target.namespace, pod_name, target.metrics_port
        );
        let request = http::Request::get(path).body(Vec::new())?;
        let body = self.client.request_text(request).await?;
        parse_active_connections(&body)
    }
}

#[cfg(test)]
mod test {
    use k8s_openapi::{
        api::core::v1::PodCondition, apimachinery::pkg::apis::meta::v1::Time,
    };
    use kube::api::ObjectMeta;

    use super::*;

    fn vote(pod: &str, time: Instant) -> EvictionVote {
        EvictionVote {
            pod_name: pod.to_string(),
            time,
        }
    }

    fn test_config() -> WatchdogConfig {
        WatchdogConfig::default()
    }

    #[test]
    fn ring_overwrites_the_oldest_slot() {
        let now = Instant::now();
        let mut ring = VoteRing::new(3);
        ring.cast(vote("a", now));
        ring.cast(vote("b", now));
        ring.cast(vote("c", now));
        ring.cast(vote("d", now));
        let tally = ring.tally();
        assert!(tally.get("a").is_none());
        assert_eq!(tally["d"], 1);
        assert_eq!(tally.values().sum::<usize>(), 3);
    }

    #[test]
    fn votes_age_out_past_the_ttl() {
        let start = Instant::now();
        let mut ring = VoteRing::new(5);
        ring.cast(vote("a", start));
        ring.cast(vote("a", start + Duration::from_secs(30)));
        // Just over the TTL for the first vote only.
        let now = start + Duration::from_secs(61);
        ring.purge_expired(now, Duration::from_secs(60));
        assert_eq!(ring.tally()["a"], 1);
    }

    #[test]
    fn no_vote_below_the_threshold() {
        // Mean 12; 20 does not clear 200% of it.
        assert_eq!(select_overloaded(&[10.0, 20.0, 10.0, 10.0, 10.0], 200.0), None);
        assert_eq!(select_overloaded(&[], 200.0), None);
    }

    #[test]
    fn sustained_outlier_reaches_quorum_on_the_nth_tick() {
        let config = test_config();
        let mut ring = VoteRing::new(config.ring_capacity);
        let start = Instant::now();
        let present: Vec<String> = (0..5).map(|i| format!("pod-{i}")).collect();
        let connections = [10.0, 40.0, 10.0, 10.0, 10.0];

        for tick in 0..config.min_votes_before_eviction {
            let now = start + Duration::from_secs(10 * tick as u64);
            let idx = select_overloaded(&connections, config.min_percent_over_avg)
                .expect("outlier should draw a vote");
            assert_eq!(idx, 1);
            ring.cast(vote(&present[idx], now));
            let evictions = ready_for_eviction(&mut ring, now, &config, &present);
            if tick + 1 < config.min_votes_before_eviction {
                assert!(evictions.is_empty(), "no eviction before tick {}", tick + 1);
            } else {
                assert_eq!(evictions, vec!["pod-1".to_string()]);
            }
        }
        // The quorum cleared its votes; the next evaluation is silent.
        assert!(ready_for_eviction(
            &mut ring,
            start + Duration::from_secs(60),
            &config,
            &present
        )
        .is_empty());
    }

    #[test]
    fn votes_for_absent_pods_never_evict() {
        let config = test_config();
        let mut ring = VoteRing::new(config.ring_capacity);
        let now = Instant::now();
        for _ in 0..config.min_votes_before_eviction {
            ring.cast(vote("gone", now));
        }
        let evictions = ready_for_eviction(&mut ring, now, &config, &["other".to_string()]);
        assert!(evictions.is_empty());
        // The stale votes still occupy their slots.
        assert_eq!(ring.tally()["gone"], config.min_votes_before_eviction);
    }

    #[test]
    fn metric_parsing_finds_the_active_gauge() {
        let body = "\
# HELP nginx_ingress_controller_nginx_process_connections current number of client connections\n\
nginx_ingress_controller_nginx_process_connections{state=\"reading\"} 0\n\
nginx_ingress_controller_nginx_process_connections{state=\"active\"} 42.5\n\
nginx_ingress_controller_nginx_process_connections{state=\"writing\"} 1\n";
        assert_eq!(parse_active_connections(body).unwrap(), 42.5);
    }

    #[test]
    fn missing_metric_is_an_error() {
        let err = parse_active_connections("some_other_metric 1\n").unwrap_err();
        assert_eq!(err.to_string(), "active connections metric not found");
    }

    fn pod(name: &str, ready: Option<bool>, age: Duration, now: DateTime<Utc>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(now - chrono::Duration::from_std(age).unwrap())),
                ..Default::default()
            },
            status: ready.map(|r| k8s_openapi::api::core::v1::PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if r { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_ready_and_old_pods_are_eligible() {
        let now = Utc::now();
        let min_age = Duration::from_secs(60);
        let pods = vec![
            pod("ready-old", Some(true), Duration::from_secs(120), now),
            pod("ready-young", Some(true), Duration::from_secs(30), now),
            pod("unready", Some(false), Duration::from_secs(120), now),
            pod("no-status", None, Duration::from_secs(120), now),
        ];
        let eligible = eligible_pods(pods, now, min_age);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name_any(), "ready-old");
    }
}
