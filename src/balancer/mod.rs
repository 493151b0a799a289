//! Upstream target pools and load-balancing strategies.

pub mod algorithms;
pub mod pool;

use std::sync::Arc;

pub use algorithms::{IpHash, LeastConnections, RoundRobin};
pub use pool::{TargetPool, TargetRuntime, TargetView};

use crate::config::LoadBalancingStrategy;
use crate::error::GatewayResult;

/// A load-balancing strategy: a pure selection function over a pool
/// snapshot, plus a state hook used by strategies that track connections.
pub trait Balancer: Send + Sync {
    /// Select one target out of the healthy subset. Errors with
    /// `NoHealthyTarget` when the subset is empty.
    fn select(&self, targets: &[TargetView], client_ip: &str) -> GatewayResult<Arc<TargetRuntime>>;

    /// Inflight accounting hook; a no-op for strategies that ignore it.
    fn update(&self, target: &TargetRuntime, delta: i64);

    fn name(&self) -> &'static str;
}

/// Build the balancer for one upstream.
pub fn make_balancer(strategy: LoadBalancingStrategy, upstream: &str) -> Arc<dyn Balancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobin::new(upstream)),
        LoadBalancingStrategy::LeastConnections => Arc::new(LeastConnections::new(upstream)),
        LoadBalancingStrategy::IpHash => Arc::new(IpHash::new(upstream)),
    }
}
