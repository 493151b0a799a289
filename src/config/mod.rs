//! Typed configuration tree for the gateway.
//!
//! Configuration is split across one YAML file per concern inside a config
//! directory: `global.yaml`, `upstreams.yaml`, `routes.yaml`,
//! `middleware.yaml`, `tls.yaml`, `health.yaml`, `metrics.yaml`. Durations
//! are human readable (`30s`, `1m`, `250ms`).

pub mod duration;
pub mod global;
pub mod middleware;
pub mod monitoring;
pub mod routes;
pub mod tls;
pub mod upstreams;
pub mod validator;
pub mod watcher;

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::info;

use crate::error::{GatewayError, GatewayResult};

pub use global::{GlobalConfig, LogConfig, ServerConfig};
pub use middleware::{MiddlewareConfig, MiddlewareDef, MiddlewareKind};
pub use monitoring::{HealthConfig, MetricsConfig};
pub use routes::{RetryPolicy, RewriteConfig, RouteRule, RoutesConfig};
pub use tls::{AcmeConfig, CertificateEntry, TlsConfig};
pub use upstreams::{
    HealthCheckConfig, LoadBalancingStrategy, TargetConfig, UpstreamService, UpstreamsConfig,
};
pub use watcher::ConfigSupervisor;

/// Full configuration assembled from the per-concern files.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub global: GlobalConfig,
    pub upstreams: UpstreamsConfig,
    pub routes: RoutesConfig,
    pub middleware: MiddlewareConfig,
    pub tls: TlsConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load every concern file from `dir`, apply defaults and validate.
    pub async fn from_dir<P: AsRef<Path>>(dir: P) -> GatewayResult<Self> {
        let dir = dir.as_ref();

        let mut config = Config {
            global: load_yaml_file(dir.join("global.yaml")).await?,
            upstreams: load_yaml_file(dir.join("upstreams.yaml")).await?,
            routes: load_yaml_file(dir.join("routes.yaml")).await?,
            middleware: load_yaml_file(dir.join("middleware.yaml")).await?,
            tls: load_yaml_file(dir.join("tls.yaml")).await?,
            health: load_yaml_file(dir.join("health.yaml")).await?,
            metrics: load_yaml_file(dir.join("metrics.yaml")).await?,
        };

        config.apply_defaults();
        validator::validate(&config)?;

        info!(config_dir = %dir.display(), "Configuration loaded");
        Ok(config)
    }

    /// Fill in the documented defaults for fields the files omitted.
    pub fn apply_defaults(&mut self) {
        self.global.apply_defaults();
        self.health.apply_defaults();
        self.metrics.apply_defaults();
        if self.tls.acme.cache_dir.is_empty() {
            self.tls.acme.cache_dir = "./certs".to_string();
        }
    }
}

async fn load_yaml_file<T, P>(path: P) -> GatewayResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        GatewayError::config_load(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        GatewayError::config_load(format!("failed to parse {}: {}", path.display(), e))
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_load_full_directory() {
        let (_guard, dir) = test_fixtures::write_config_dir();
        let config = Config::from_dir(&dir).await.unwrap();

        assert_eq!(config.global.server.http_port, 8080);
        assert_eq!(config.global.server.read_timeout, Duration::from_secs(30));
        assert!(config.upstreams.services.contains_key("api-service"));
        assert_eq!(config.routes.rules.len(), 1);
        assert_eq!(config.routes.rules[0].retry_policy.attempts, 2);
        assert_eq!(
            config.routes.rules[0].retry_policy.backoff,
            Duration::from_millis(10)
        );
        assert!(!config.tls.enabled);
    }

    #[tokio::test]
    async fn test_missing_file_is_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::from_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConfigLoad { .. }));
    }

    #[tokio::test]
    async fn test_yaml_roundtrip_is_equivalent() {
        let (_guard, dir) = test_fixtures::write_config_dir();
        let config = Config::from_dir(&dir).await.unwrap();

        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&serialized).unwrap();

        assert_eq!(
            reparsed.global.server.read_timeout,
            config.global.server.read_timeout
        );
        assert_eq!(reparsed.routes.rules.len(), config.routes.rules.len());
        assert_eq!(
            reparsed.routes.rules[0].retry_policy.backoff,
            config.routes.rules[0].retry_policy.backoff
        );
        assert_eq!(
            reparsed.upstreams.services["api-service"].targets.len(),
            config.upstreams.services["api-service"].targets.len()
        );
    }
}
