//! The three load-balancing strategies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::pool::{TargetRuntime, TargetView};
use super::Balancer;
use crate::error::{GatewayError, GatewayResult};

/// Round-robin over healthy targets. The counter is monotonically
/// increasing per upstream; concurrent selections receive distinct
/// sequence values. Target weights are parsed but do not influence
/// selection.
pub struct RoundRobin {
    upstream: String,
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new(upstream: &str) -> Self {
        Self {
            upstream: upstream.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn select(&self, targets: &[TargetView], _client_ip: &str) -> GatewayResult<Arc<TargetRuntime>> {
        let healthy: Vec<&TargetView> = targets.iter().filter(|t| t.healthy).collect();
        if healthy.is_empty() {
            return Err(GatewayError::no_healthy_target(&self.upstream));
        }
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (seq % healthy.len() as u64) as usize;
        Ok(Arc::clone(&healthy[index].runtime))
    }

    fn update(&self, _target: &TargetRuntime, _delta: i64) {}

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Least-connections: the healthy target with the minimum inflight count,
/// ties broken by first occurrence in the upstream's declared order.
pub struct LeastConnections {
    upstream: String,
}

impl LeastConnections {
    pub fn new(upstream: &str) -> Self {
        Self {
            upstream: upstream.to_string(),
        }
    }
}

impl Balancer for LeastConnections {
    fn select(&self, targets: &[TargetView], _client_ip: &str) -> GatewayResult<Arc<TargetRuntime>> {
        let mut selected: Option<&TargetView> = None;
        for view in targets.iter().filter(|t| t.healthy) {
            match selected {
                Some(current) if current.inflight <= view.inflight => {}
                _ => selected = Some(view),
            }
        }
        selected
            .map(|view| Arc::clone(&view.runtime))
            .ok_or_else(|| GatewayError::no_healthy_target(&self.upstream))
    }

    fn update(&self, target: &TargetRuntime, delta: i64) {
        target.adjust_inflight(delta);
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// IP-hash: FNV-1a over the client IP's textual form, modulo the healthy
/// count. The same IP maps to the same target while pool membership is
/// unchanged; membership changes may remap.
pub struct IpHash {
    upstream: String,
}

impl IpHash {
    pub fn new(upstream: &str) -> Self {
        Self {
            upstream: upstream.to_string(),
        }
    }
}

impl Balancer for IpHash {
    fn select(&self, targets: &[TargetView], client_ip: &str) -> GatewayResult<Arc<TargetRuntime>> {
        let healthy: Vec<&TargetView> = targets.iter().filter(|t| t.healthy).collect();
        if healthy.is_empty() {
            return Err(GatewayError::no_healthy_target(&self.upstream));
        }
        let index = (fnv1a_32(client_ip.as_bytes()) as usize) % healthy.len();
        Ok(Arc::clone(&healthy[index].runtime))
    }

    fn update(&self, _target: &TargetRuntime, _delta: i64) {}

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

/// 32-bit FNV-1a.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::pool::TargetPool;
    use crate::config::{HealthCheckConfig, LoadBalancingStrategy, TargetConfig, UpstreamService};
    use crate::health::HealthState;

    fn pool(urls: &[&str]) -> TargetPool {
        let service = UpstreamService {
            load_balancer: LoadBalancingStrategy::RoundRobin,
            health_check: HealthCheckConfig::default(),
            targets: urls
                .iter()
                .map(|u| TargetConfig {
                    url: u.to_string(),
                    weight: 1,
                })
                .collect(),
        };
        TargetPool::from_config("test", &service, None).unwrap()
    }

    #[test]
    fn test_round_robin_rotates_evenly() {
        let pool = pool(&["http://a:1", "http://b:1", "http://c:1"]);
        let lb = RoundRobin::new("test");
        let views = pool.snapshot();

        let picks: Vec<String> = (0..6)
            .map(|_| lb.select(&views, "10.0.0.1").unwrap().url().to_string())
            .collect();

        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        // All three appear within one cycle
        let mut cycle = picks[..3].to_vec();
        cycle.sort();
        cycle.dedup();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_round_robin_distribution_differs_by_at_most_one() {
        let pool = pool(&["http://a:1", "http://b:1"]);
        let lb = RoundRobin::new("test");
        let views = pool.snapshot();

        let mut counts = std::collections::HashMap::new();
        for _ in 0..11 {
            let url = lb.select(&views, "").unwrap().url().to_string();
            *counts.entry(url).or_insert(0u32) += 1;
        }
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let pool = pool(&["http://a:1", "http://b:1"]);
        pool.targets()[0].set_health_state(HealthState::Unhealthy);
        let lb = RoundRobin::new("test");

        for _ in 0..4 {
            let picked = lb.select(&pool.snapshot(), "").unwrap();
            assert_eq!(picked.url(), "http://b:1");
        }
    }

    #[test]
    fn test_no_healthy_target_error() {
        let pool = pool(&["http://a:1"]);
        pool.targets()[0].set_health_state(HealthState::Unhealthy);

        for lb in [
            Box::new(RoundRobin::new("test")) as Box<dyn Balancer>,
            Box::new(LeastConnections::new("test")),
            Box::new(IpHash::new("test")),
        ] {
            let err = lb.select(&pool.snapshot(), "10.0.0.1").unwrap_err();
            assert!(matches!(err, GatewayError::NoHealthyTarget { .. }));
        }
    }

    #[test]
    fn test_empty_pool_yields_no_healthy_target() {
        let lb = RoundRobin::new("test");
        let err = lb.select(&[], "").unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyTarget { .. }));
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let pool = pool(&["http://a:1", "http://b:1", "http://c:1"]);
        pool.targets()[0].adjust_inflight(3);
        pool.targets()[1].adjust_inflight(1);
        pool.targets()[2].adjust_inflight(2);

        let lb = LeastConnections::new("test");
        let picked = lb.select(&pool.snapshot(), "").unwrap();
        assert_eq!(picked.url(), "http://b:1");
    }

    #[test]
    fn test_least_connections_tie_breaks_by_declared_order() {
        let pool = pool(&["http://a:1", "http://b:1"]);
        let lb = LeastConnections::new("test");
        let picked = lb.select(&pool.snapshot(), "").unwrap();
        assert_eq!(picked.url(), "http://a:1");
    }

    #[test]
    fn test_least_connections_update_tracks_inflight() {
        let pool = pool(&["http://a:1"]);
        let lb = LeastConnections::new("test");
        let target = lb.select(&pool.snapshot(), "").unwrap();

        lb.update(&target, 1);
        assert_eq!(target.inflight(), 1);
        lb.update(&target, -1);
        assert_eq!(target.inflight(), 0);
    }

    #[test]
    fn test_ip_hash_is_stable_for_same_ip() {
        let pool = pool(&["http://a:1", "http://b:1", "http://c:1"]);
        let lb = IpHash::new("test");
        let views = pool.snapshot();

        let first = lb.select(&views, "10.0.0.1").unwrap().url().to_string();
        for _ in 0..100 {
            assert_eq!(lb.select(&views, "10.0.0.1").unwrap().url(), first);
        }
    }

    #[test]
    fn test_ip_hash_uses_fnv1a() {
        // Reference FNV-1a 32-bit values
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
    }
}
