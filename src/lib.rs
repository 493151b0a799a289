pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod monitoring;
pub mod proxy;
pub mod routing;
pub mod snapshot;
pub mod tls;

// Re-export commonly used types
pub use balancer::{Balancer, TargetPool, TargetRuntime};
pub use config::{Config, ConfigSupervisor};
pub use error::{GatewayError, GatewayResult};
pub use health::{HealthChecker, HealthState};
pub use proxy::{ProxyEngine, ProxyServer};
pub use routing::Router;
pub use snapshot::Snapshot;
pub use tls::TlsManager;
