//! The health supervisor: one long-running task that probes every
//! registered target and drives the per-target hysteresis state machine.

use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{HealthState, ProbeOutcome, TargetHealth};
use crate::balancer::TargetRuntime;
use crate::config::{HealthCheckConfig, HealthConfig};
use crate::error::GatewayResult;

type ProbeClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

#[derive(Clone)]
struct Entry {
    upstream: String,
    spec: HealthCheckConfig,
    target: Arc<TargetRuntime>,
}

pub struct HealthChecker {
    config: HealthConfig,
    registry: RwLock<Vec<Entry>>,
    client: ProbeClient,
}

/// Cooperative stop handle: signalling `stop` ends the probe loop; awaiting
/// `done` confirms in-flight probes have been cancelled or finished.
pub struct HealthCheckerHandle {
    stop: watch::Sender<bool>,
    done: oneshot::Receiver<()>,
}

impl HealthCheckerHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.done.await;
    }
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        // Keep-alive is disabled on the probe pool so a dead backend cannot
        // look alive through a stale pooled connection.
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build::<_, Body>(https);

        Self {
            config,
            registry: RwLock::new(Vec::new()),
            client,
        }
    }

    /// Replace the registered target set. Called at startup and after every
    /// snapshot publish; carried-over `TargetRuntime`s keep their streaks.
    pub fn register_targets(
        &self,
        entries: impl IntoIterator<Item = (String, HealthCheckConfig, Arc<TargetRuntime>)>,
    ) {
        let entries: Vec<Entry> = entries
            .into_iter()
            .map(|(upstream, spec, target)| Entry {
                upstream,
                spec,
                target,
            })
            .collect();
        debug!(targets = entries.len(), "Health registry updated");
        *self.registry.write().unwrap() = entries;
    }

    /// Health report for every registered target, probed or not.
    pub fn reports(&self) -> Vec<TargetHealth> {
        self.registry
            .read()
            .unwrap()
            .iter()
            .map(|e| e.target.health_report(&e.upstream))
            .collect()
    }

    /// Spawn the probe loop. Returns immediately with the stop handle.
    pub fn start(self: Arc<Self>) -> HealthCheckerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        if !self.config.enabled {
            info!("Health checker disabled");
            let _ = done_tx.send(());
            return HealthCheckerHandle {
                stop: stop_tx,
                done: done_rx,
            };
        }

        info!(
            interval = ?self.config.interval,
            timeout = ?self.config.timeout,
            "Starting health checker"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let mut probe_stop = stop_rx.clone();
                self.probe_all(&mut probe_stop).await;
                if *stop_rx.borrow() {
                    break;
                }
            }
            info!("Health checker stopped");
            let _ = done_tx.send(());
        });

        HealthCheckerHandle {
            stop: stop_tx,
            done: done_rx,
        }
    }

    /// Probe every due target concurrently and fold the outcomes into the
    /// state machines. Due means: checking enabled for the upstream and the
    /// upstream's own interval has elapsed since the last probe.
    async fn probe_all(&self, stop: &mut watch::Receiver<bool>) {
        let due: Vec<Entry> = {
            let registry = self.registry.read().unwrap();
            registry
                .iter()
                .filter(|e| e.spec.enabled)
                .filter(|e| match e.target.last_probe_elapsed() {
                    Some(elapsed) => elapsed >= e.spec.interval,
                    None => true,
                })
                .cloned()
                .collect()
        };

        let mut probes = JoinSet::new();
        for entry in due {
            let client = self.client.clone();
            probes.spawn(async move {
                let outcome = probe_target(&client, &entry).await;
                apply_outcome(&entry.target, &entry.spec, &entry.upstream, outcome);
            });
        }

        loop {
            let event = tokio::select! {
                joined = probes.join_next() => Some(joined),
                _ = stop.changed() => None,
            };
            match event {
                // Set fully drained
                Some(None) => break,
                // One probe finished, keep draining
                Some(Some(_)) => {}
                // Stop requested, cancel in-flight probes
                None => {
                    probes.abort_all();
                    break;
                }
            }
        }

        let healthy = self
            .registry
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.target.health_state() == HealthState::Healthy)
            .count();
        metrics::gauge!("gatehouse_healthy_targets").set(healthy as f64);
    }
}

async fn probe_target(client: &ProbeClient, entry: &Entry) -> ProbeOutcome {
    let url = format!(
        "{}{}",
        entry.target.url().trim_end_matches('/'),
        entry.spec.path
    );
    let started = Instant::now();

    let result: GatewayResult<hyper::StatusCode> = async {
        let request = Request::builder()
            .method(hyper::Method::GET)
            .uri(&url)
            .body(Body::empty())?;
        let response = tokio::time::timeout(entry.spec.timeout, client.request(request)).await??;
        Ok(response.status())
    }
    .await;

    metrics::counter!("gatehouse_health_probes_total").increment(1);

    match result {
        Ok(status) if status.is_success() => ProbeOutcome::Ok {
            rtt: started.elapsed(),
        },
        Ok(status) => ProbeOutcome::Fail {
            reason: format!("unhealthy status code: {}", status.as_u16()),
        },
        Err(e) => ProbeOutcome::Fail {
            reason: e.to_string(),
        },
    }
}

/// Fold one probe outcome into a target's state machine. Transitions only
/// happen once the configured streak is reached; a single opposite outcome
/// resets the streak.
pub fn apply_outcome(
    target: &TargetRuntime,
    spec: &HealthCheckConfig,
    upstream: &str,
    outcome: ProbeOutcome,
) {
    let previous = target.health_state();
    match outcome {
        ProbeOutcome::Ok { rtt } => {
            let (ok, _) = target.record_success();
            target.note_probe(Some(rtt), None);
            if ok >= spec.success_threshold && previous != HealthState::Healthy {
                target.set_health_state(HealthState::Healthy);
                info!(
                    url = target.url(),
                    upstream, consecutive_successes = ok, "Target became healthy"
                );
            }
        }
        ProbeOutcome::Fail { reason } => {
            let (_, fail) = target.record_failure();
            target.note_probe(None, Some(reason.clone()));
            if fail >= spec.failure_threshold && previous != HealthState::Unhealthy {
                target.set_health_state(HealthState::Unhealthy);
                warn!(
                    url = target.url(),
                    upstream,
                    consecutive_failures = fail,
                    error = %reason,
                    "Target became unhealthy"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(failure_threshold: u32, success_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            path: "/health".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            failure_threshold,
            success_threshold,
        }
    }

    fn ok() -> ProbeOutcome {
        ProbeOutcome::Ok {
            rtt: Duration::from_millis(5),
        }
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Fail {
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_hysteresis_flip_sequence() {
        // failure_threshold=3, success_threshold=2
        let target = TargetRuntime::new("http://127.0.0.1:3000", 1).unwrap();
        let spec = spec(3, 2);
        target.set_health_state(HealthState::Healthy);

        // 2 failures then 1 success: still healthy
        apply_outcome(&target, &spec, "u", fail());
        apply_outcome(&target, &spec, "u", fail());
        apply_outcome(&target, &spec, "u", ok());
        assert_eq!(target.health_state(), HealthState::Healthy);

        // 3 consecutive failures: unhealthy
        apply_outcome(&target, &spec, "u", fail());
        apply_outcome(&target, &spec, "u", fail());
        apply_outcome(&target, &spec, "u", fail());
        assert_eq!(target.health_state(), HealthState::Unhealthy);

        // 1 success: still unhealthy
        apply_outcome(&target, &spec, "u", ok());
        assert_eq!(target.health_state(), HealthState::Unhealthy);

        // 2 consecutive successes: healthy again
        apply_outcome(&target, &spec, "u", ok());
        assert_eq!(target.health_state(), HealthState::Healthy);
    }

    #[test]
    fn test_unknown_target_becomes_healthy_after_streak() {
        let target = TargetRuntime::new("http://127.0.0.1:3000", 1).unwrap();
        let spec = spec(3, 2);

        assert_eq!(target.health_state(), HealthState::Unknown);
        apply_outcome(&target, &spec, "u", ok());
        assert_eq!(target.health_state(), HealthState::Unknown);
        apply_outcome(&target, &spec, "u", ok());
        assert_eq!(target.health_state(), HealthState::Healthy);
    }

    #[test]
    fn test_opposite_outcome_resets_streak() {
        let target = TargetRuntime::new("http://127.0.0.1:3000", 1).unwrap();
        let spec = spec(2, 2);
        target.set_health_state(HealthState::Healthy);

        apply_outcome(&target, &spec, "u", fail());
        apply_outcome(&target, &spec, "u", ok());
        apply_outcome(&target, &spec, "u", fail());
        // Never two consecutive failures, so no flip
        assert_eq!(target.health_state(), HealthState::Healthy);
    }

    #[test]
    fn test_probe_failure_records_error() {
        let target = TargetRuntime::new("http://127.0.0.1:3000", 1).unwrap();
        let spec = spec(1, 1);
        apply_outcome(&target, &spec, "api", fail());

        let report = target.health_report("api");
        assert_eq!(report.state, HealthState::Unhealthy);
        assert_eq!(report.last_error.as_deref(), Some("connection refused"));
        assert_eq!(report.upstream, "api");
    }

    #[tokio::test]
    async fn test_disabled_checker_stops_immediately() {
        let checker = Arc::new(HealthChecker::new(HealthConfig {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            port: 8081,
        }));
        let handle = checker.start();
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop should resolve immediately when disabled");
    }

    #[tokio::test]
    async fn test_registry_reports() {
        let checker = Arc::new(HealthChecker::new(HealthConfig {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            port: 8081,
        }));
        let target = Arc::new(TargetRuntime::new("http://127.0.0.1:3000", 1).unwrap());
        checker.register_targets(vec![("api".to_string(), spec(3, 2), target)]);

        let reports = checker.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, HealthState::Unknown);
    }
}
