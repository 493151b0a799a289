use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::duration;

/// Named upstream pools (`upstreams.yaml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamsConfig {
    /// Ordered by name so reload diffs and logs are stable.
    pub services: BTreeMap<String, UpstreamService>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamService {
    #[serde(default)]
    pub load_balancer: LoadBalancingStrategy,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    pub targets: Vec<TargetConfig>,
}

/// One backend, identified by an absolute URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::IpHash => "ip_hash",
        }
    }
}

/// Per-upstream active health-check policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/health".to_string(),
            interval: default_interval(),
            timeout: default_timeout(),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}
