//! The immutable configuration snapshot the request path reads.
//!
//! A snapshot is built offline from a validated `Config` and published
//! through a single `ArcSwap` pointer: readers load it once per request and
//! never observe a partially-applied reload. Target runtime state is carried
//! over from the previous snapshot for every target whose URL is unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::{make_balancer, Balancer, TargetPool, TargetRuntime};
use crate::config::{Config, HealthCheckConfig, RetryPolicy};
use crate::error::GatewayResult;
use crate::middleware::{Chain, HeadersMiddleware, MiddlewareRegistry};
use crate::routing::Router;

/// One upstream pool with its selection strategy.
pub struct Upstream {
    pub name: String,
    pub pool: TargetPool,
    pub balancer: Arc<dyn Balancer>,
}

/// A route's precomposed middleware chain and execution knobs, parallel to
/// the router's rule list.
pub struct RouteChain {
    pub chain: Chain,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

pub struct Snapshot {
    pub version: u64,
    pub config: Config,
    pub router: Router,
    pub upstreams: HashMap<String, Upstream>,
    pub route_chains: Vec<RouteChain>,
}

impl Snapshot {
    /// Build a snapshot from validated configuration. `previous` supplies
    /// runtime state to carry over across a reload.
    pub fn build(
        config: Config,
        previous: Option<&Snapshot>,
        version: u64,
    ) -> GatewayResult<Arc<Self>> {
        let mut upstreams = HashMap::new();
        for (name, service) in &config.upstreams.services {
            let previous_pool = previous
                .and_then(|s| s.upstreams.get(name))
                .map(|u| &u.pool);
            let pool = TargetPool::from_config(name, service, previous_pool)?;
            upstreams.insert(
                name.clone(),
                Upstream {
                    name: name.clone(),
                    pool,
                    balancer: make_balancer(service.load_balancer, name),
                },
            );
        }

        let router = Router::build(&config.routes);
        let registry = MiddlewareRegistry::build(&config.middleware.chain)?;

        let route_chains = router
            .routes()
            .iter()
            .map(|route| {
                let mut middlewares = registry.resolve_route_chain(&route.rule.middleware);
                if !route.rule.headers.is_empty() {
                    middlewares.push(Arc::new(HeadersMiddleware::new(&route.rule.headers)));
                }
                RouteChain {
                    chain: Chain::new(middlewares),
                    retry: route.rule.retry_policy.clone(),
                    timeout: route.rule.timeout,
                }
            })
            .collect();

        Ok(Arc::new(Self {
            version,
            config,
            router,
            upstreams,
            route_chains,
        }))
    }

    /// Everything the health supervisor needs to register: upstream name,
    /// that upstream's probe spec, and the shared target runtime.
    pub fn health_entries(&self) -> Vec<(String, HealthCheckConfig, Arc<TargetRuntime>)> {
        let mut entries = Vec::new();
        for upstream in self.upstreams.values() {
            let spec = &self.config.upstreams.services[&upstream.name].health_check;
            for target in upstream.pool.targets() {
                entries.push((upstream.name.clone(), spec.clone(), Arc::clone(target)));
            }
        }
        entries
    }
}
