use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration;

/// Health supervisor settings (`health.yaml`): supervisor cadence plus the
/// dedicated health-endpoint listener port.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(default = "default_health_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub port: u16,
}

/// Prometheus exposition settings (`metrics.yaml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

impl HealthConfig {
    pub fn apply_defaults(&mut self) {
        if self.port == 0 {
            self.port = 8081;
        }
    }
}

impl MetricsConfig {
    pub fn apply_defaults(&mut self) {
        if self.port == 0 {
            self.port = 8082;
        }
        if self.path.is_empty() {
            self.path = "/metrics".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let mut health: HealthConfig = serde_yaml::from_str("enabled: true\n").unwrap();
        health.apply_defaults();
        assert_eq!(health.interval, Duration::from_secs(30));
        assert_eq!(health.timeout, Duration::from_secs(5));
        assert_eq!(health.port, 8081);

        let mut metrics: MetricsConfig = serde_yaml::from_str("enabled: true\n").unwrap();
        metrics.apply_defaults();
        assert_eq!(metrics.port, 8082);
        assert_eq!(metrics.path, "/metrics");
    }
}
