use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::duration;

/// Routing table (`routes.yaml`). Rules are evaluated in declared order;
/// the first match wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutesConfig {
    pub rules: Vec<RouteRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteRule {
    /// Literal host to match; empty matches any host. Compared against the
    /// request Host header with any `:port` suffix stripped.
    #[serde(default)]
    pub host: String,
    /// Literal path, or a literal suffixed with `/*` for prefix matching.
    pub path: String,
    /// Empty list matches any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream: String,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    /// Names into the middleware chain, applied in this order.
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Response headers set when the route's response head is written.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Upper bound on the whole handler, retries included. Zero disables.
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RewriteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl RewriteConfig {
    pub fn is_empty(&self) -> bool {
        self.strip_prefix.is_none() && self.add_prefix.is_none() && self.regex.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first; zero disables retries.
    pub attempts: u32,
    /// Constant delay between attempts.
    #[serde(default, with = "duration")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}
