//! Per-target runtime state and the pool that owns it for one upstream.

use hyper::Uri;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::UpstreamService;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthState, TargetHealth};

/// Mutable per-target state, shared between the pool, the balancers and the
/// health supervisor. Survives config reloads as long as the target URL
/// string is unchanged.
#[derive(Debug)]
pub struct TargetRuntime {
    url: String,
    uri: Uri,
    weight: u32,
    inflight: AtomicI64,
    health: AtomicU8,
    consec_fail: AtomicU32,
    consec_ok: AtomicU32,
    last_probe: Mutex<Option<Instant>>,
    last_rtt: Mutex<Option<Duration>>,
    last_error: Mutex<Option<String>>,
}

impl TargetRuntime {
    pub fn new(url: &str, weight: u32) -> GatewayResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| GatewayError::config_validation(format!("invalid target URL: {}", e)))?;
        if uri.authority().is_none() {
            return Err(GatewayError::config_validation(format!(
                "target URL missing authority: {}",
                url
            )));
        }
        Ok(Self {
            url: url.to_string(),
            uri,
            weight,
            inflight: AtomicI64::new(0),
            health: AtomicU8::new(HealthState::Unknown.as_u8()),
            consec_fail: AtomicU32::new(0),
            consec_ok: AtomicU32::new(0),
            last_probe: Mutex::new(None),
            last_rtt: Mutex::new(None),
            last_error: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Atomic add, clamped at zero from below. Decrements past zero are
    /// absorbed rather than wrapping.
    pub fn adjust_inflight(&self, delta: i64) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + delta).max(0))
            });
    }

    pub fn health_state(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health_state(&self, state: HealthState) {
        self.health.store(state.as_u8(), Ordering::Release);
    }

    /// Selection eligibility: anything not known-unhealthy is eligible,
    /// which keeps newly added and unprobed targets in rotation.
    pub fn is_eligible(&self) -> bool {
        self.health_state() != HealthState::Unhealthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consec_fail.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consec_ok.load(Ordering::Acquire)
    }

    pub(crate) fn record_success(&self) -> (u32, u32) {
        self.consec_fail.store(0, Ordering::Release);
        let ok = self.consec_ok.fetch_add(1, Ordering::AcqRel) + 1;
        (ok, 0)
    }

    pub(crate) fn record_failure(&self) -> (u32, u32) {
        self.consec_ok.store(0, Ordering::Release);
        let fail = self.consec_fail.fetch_add(1, Ordering::AcqRel) + 1;
        (0, fail)
    }

    pub(crate) fn last_probe_elapsed(&self) -> Option<Duration> {
        self.last_probe.lock().unwrap().map(|at| at.elapsed())
    }

    pub(crate) fn note_probe(&self, rtt: Option<Duration>, error: Option<String>) {
        *self.last_probe.lock().unwrap() = Some(Instant::now());
        if rtt.is_some() {
            *self.last_rtt.lock().unwrap() = rtt;
        }
        *self.last_error.lock().unwrap() = error;
    }

    pub fn health_report(&self, upstream: &str) -> TargetHealth {
        TargetHealth {
            url: self.url.clone(),
            upstream: upstream.to_string(),
            state: self.health_state(),
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            last_rtt: *self.last_rtt.lock().unwrap(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}

/// Stable copy of one target's selection-relevant state at snapshot time.
#[derive(Debug, Clone)]
pub struct TargetView {
    pub runtime: Arc<TargetRuntime>,
    pub healthy: bool,
    pub inflight: i64,
}

/// Owns the ordered `TargetRuntime` list for one upstream.
#[derive(Debug)]
pub struct TargetPool {
    upstream: String,
    targets: Vec<Arc<TargetRuntime>>,
}

impl TargetPool {
    /// Build the pool from configuration. When `previous` is given, runtime
    /// state is carried over for every target whose URL is unchanged;
    /// anything else starts fresh in `Unknown` health with zero inflight.
    pub fn from_config(
        upstream: &str,
        service: &UpstreamService,
        previous: Option<&TargetPool>,
    ) -> GatewayResult<Self> {
        let mut targets = Vec::with_capacity(service.targets.len());
        for target in &service.targets {
            let carried = previous.and_then(|pool| {
                pool.targets
                    .iter()
                    .find(|t| t.url == target.url)
                    .map(Arc::clone)
            });
            match carried {
                Some(runtime) => targets.push(runtime),
                None => targets.push(Arc::new(TargetRuntime::new(&target.url, target.weight)?)),
            }
        }
        Ok(Self {
            upstream: upstream.to_string(),
            targets,
        })
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn targets(&self) -> &[Arc<TargetRuntime>] {
        &self.targets
    }

    /// Stable copy of the pool, capturing health and inflight at call time.
    pub fn snapshot(&self) -> Vec<TargetView> {
        self.targets
            .iter()
            .map(|t| TargetView {
                runtime: Arc::clone(t),
                healthy: t.is_eligible(),
                inflight: t.inflight(),
            })
            .collect()
    }

    pub fn adjust_inflight(&self, target: &TargetRuntime, delta: i64) {
        if let Some(t) = self.targets.iter().find(|t| t.url == target.url) {
            t.adjust_inflight(delta);
        }
    }
}
