use hyper::Method;

use super::rewrite::Rewriter;
use super::strip_host_port;
use crate::config::{RouteRule, RoutesConfig};

/// One rule with its rewrite pieces prepared at snapshot-build time.
pub struct CompiledRoute {
    pub rule: RouteRule,
    pub index: usize,
    pub rewriter: Rewriter,
}

/// The routing table. Rules are evaluated in declared order; the first rule
/// whose host, path and method predicates all hold wins.
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    pub fn build(config: &RoutesConfig) -> Self {
        let routes = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRoute {
                rewriter: Rewriter::compile(&rule.rewrite),
                rule: rule.clone(),
                index,
            })
            .collect();
        Self { routes }
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    /// Find the first matching rule, or `None` for a 404.
    pub fn match_request(&self, host: &str, path: &str, method: &Method) -> Option<&CompiledRoute> {
        let request_host = strip_host_port(host);
        self.routes
            .iter()
            .find(|route| route.matches(request_host, path, method))
    }
}

impl CompiledRoute {
    fn matches(&self, host: &str, path: &str, method: &Method) -> bool {
        // Host: empty rule host is a wildcard; otherwise literal comparison
        if !self.rule.host.is_empty() && self.rule.host != host {
            return false;
        }

        // Path: `/*` suffix means prefix match on the part before it
        if let Some(prefix) = self.rule.path.strip_suffix("/*") {
            if !path.starts_with(prefix) {
                return false;
            }
        } else if path != self.rule.path {
            return false;
        }

        // Methods: empty list matches anything
        if !self.rule.methods.is_empty()
            && !self.rule.methods.iter().any(|m| m == method.as_str())
        {
            return false;
        }

        true
    }
}
