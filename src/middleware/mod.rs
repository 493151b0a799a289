//! The middleware pipeline.
//!
//! A middleware wraps a handler: it sees the request on the way in and the
//! response on the way out. Chains compose right-to-left, so the
//! first-ordered middleware observes the request first and the response
//! last. Instances are built once per configuration snapshot and shared by
//! every route that references them, which keeps per-instance state (rate
//! limiter buckets) global to the definition rather than per route.

pub mod auth;
pub mod compression;
pub mod headers;
pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use hyper::{Body, HeaderMap, Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::config::{MiddlewareDef, MiddlewareKind};
use crate::error::{GatewayError, GatewayResult};

pub use headers::HeadersMiddleware;

/// Request-scoped data the pipeline needs besides the request itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote_addr: SocketAddr,
    /// Resolved once per request via [`client_ip`].
    pub client_ip: String,
    pub scheme: &'static str,
}

impl RequestContext {
    pub fn new(remote_addr: SocketAddr, headers: &HeaderMap, scheme: &'static str) -> Self {
        Self {
            remote_addr,
            client_ip: client_ip(headers, remote_addr),
            scheme,
        }
    }
}

/// Client IP precedence: `X-Real-IP`, then the first `X-Forwarded-For`
/// entry, then the remote socket address.
pub fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !ip.trim().is_empty() {
            return ip.trim().to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote_addr.ip().to_string()
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>>;

    fn name(&self) -> &str;
}

/// The innermost handler a chain wraps.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, req: Request<Body>, ctx: &RequestContext)
        -> GatewayResult<Response<Body>>;
}

/// The remainder of a chain from one middleware's point of view.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        req: Request<Body>,
        ctx: &RequestContext,
    ) -> GatewayResult<Response<Body>> {
        match self.chain.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                current.handle(req, ctx, next).await
            }
            None => self.endpoint.call(req, ctx).await,
        }
    }
}

/// An ordered middleware sequence ready to wrap an endpoint.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        endpoint: &dyn Endpoint,
    ) -> GatewayResult<Response<Body>> {
        Next {
            chain: &self.middlewares,
            endpoint,
        }
        .run(req, ctx)
        .await
    }
}

/// Enabled middleware instances from one snapshot, addressable by name.
pub struct MiddlewareRegistry {
    by_name: HashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    /// Instantiate every enabled definition, in ascending `order`.
    pub fn build(defs: &[MiddlewareDef]) -> GatewayResult<Self> {
        let mut sorted: Vec<&MiddlewareDef> = defs.iter().filter(|d| d.enabled).collect();
        sorted.sort_by_key(|d| d.order);

        let mut by_name = HashMap::new();
        for def in sorted {
            let instance = instantiate(def)?;
            by_name.insert(def.name.clone(), instance);
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.by_name.get(name).map(Arc::clone)
    }

    /// Resolve a route's middleware references, in the route's order.
    /// References to disabled definitions are skipped.
    pub fn resolve_route_chain(&self, names: &[String]) -> Vec<Arc<dyn Middleware>> {
        let mut chain = Vec::with_capacity(names.len());
        for name in names {
            match self.get(name) {
                Some(instance) => chain.push(instance),
                None => warn!(middleware = %name, "Route references disabled middleware, skipping"),
            }
        }
        chain
    }
}

fn instantiate(def: &MiddlewareDef) -> GatewayResult<Arc<dyn Middleware>> {
    let invalid = |e: serde_yaml::Error| {
        GatewayError::config_validation(format!(
            "middleware '{}': invalid config: {}",
            def.name, e
        ))
    };

    let instance: Arc<dyn Middleware> = match def.kind {
        MiddlewareKind::Logging => Arc::new(logging::LoggingMiddleware::new(
            serde_yaml::from_value(def.params_value()).map_err(invalid)?,
        )),
        MiddlewareKind::RateLimit => Arc::new(rate_limit::RateLimitMiddleware::new(
            serde_yaml::from_value(def.params_value()).map_err(invalid)?,
        )?),
        MiddlewareKind::Auth => Arc::new(auth::AuthMiddleware::new(
            serde_yaml::from_value(def.params_value()).map_err(invalid)?,
        )?),
        MiddlewareKind::Compression => Arc::new(compression::CompressionMiddleware::new(
            serde_yaml::from_value(def.params_value()).map_err(invalid)?,
        )?),
    };
    Ok(instance)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use hyper::StatusCode;

    /// Endpoint that answers with a canned status and body and remembers
    /// how many times it was called.
    pub struct StaticEndpoint {
        pub status: StatusCode,
        pub body: String,
        pub content_type: &'static str,
        pub calls: std::sync::atomic::AtomicU32,
    }

    impl StaticEndpoint {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self {
                status,
                body: body.to_string(),
                content_type: "text/plain",
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Endpoint for StaticEndpoint {
        async fn call(
            &self,
            _req: Request<Body>,
            _ctx: &RequestContext,
        ) -> GatewayResult<Response<Body>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Response::builder()
                .status(self.status)
                .header("content-type", self.content_type)
                .body(Body::from(self.body.clone()))?)
        }
    }

    pub fn test_ctx() -> RequestContext {
        let remote: SocketAddr = "192.0.2.7:52110".parse().unwrap();
        RequestContext {
            remote_addr: remote,
            client_ip: "192.0.2.7".to_string(),
            scheme: "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use test_support::{test_ctx, StaticEndpoint};

    struct TagMiddleware {
        tag: &'static str,
    }

    #[async_trait]
    impl Middleware for TagMiddleware {
        async fn handle(
            &self,
            mut req: Request<Body>,
            ctx: &RequestContext,
            next: Next<'_>,
        ) -> GatewayResult<Response<Body>> {
            // Append to a request header on the way in, and to a response
            // header on the way out.
            let seen = req
                .headers()
                .get("x-seen")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let joined = if seen.is_empty() {
                self.tag.to_string()
            } else {
                format!("{},{}", seen, self.tag)
            };
            req.headers_mut().insert("x-seen", joined.parse().unwrap());

            let mut resp = next.run(req, ctx).await?;
            let unwound = resp
                .headers()
                .get("x-unwound")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let joined = if unwound.is_empty() {
                self.tag.to_string()
            } else {
                format!("{},{}", unwound, self.tag)
            };
            resp.headers_mut()
                .insert("x-unwound", joined.parse().unwrap());
            Ok(resp)
        }

        fn name(&self) -> &str {
            self.tag
        }
    }

    struct EchoSeenEndpoint;

    #[async_trait]
    impl Endpoint for EchoSeenEndpoint {
        async fn call(
            &self,
            req: Request<Body>,
            _ctx: &RequestContext,
        ) -> GatewayResult<Response<Body>> {
            let seen = req
                .headers()
                .get("x-seen")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            Ok(Response::builder()
                .header("x-request-order", seen)
                .body(Body::empty())?)
        }
    }

    #[tokio::test]
    async fn test_chain_ordering() {
        let chain = Chain::new(vec![
            Arc::new(TagMiddleware { tag: "a" }),
            Arc::new(TagMiddleware { tag: "b" }),
        ]);
        let req = Request::builder().body(Body::empty()).unwrap();
        let resp = chain.run(req, &test_ctx(), &EchoSeenEndpoint).await.unwrap();

        // First middleware sees the request first...
        assert_eq!(resp.headers()["x-request-order"], "a,b");
        // ...and the response last.
        assert_eq!(resp.headers()["x-unwound"], "b,a");
    }

    #[tokio::test]
    async fn test_empty_chain_calls_endpoint() {
        let chain = Chain::default();
        let endpoint = StaticEndpoint::new(StatusCode::OK, "hi");
        let req = Request::builder().body(Body::empty()).unwrap();
        let resp = chain.run(req, &test_ctx(), &endpoint).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_client_ip_precedence() {
        let remote: SocketAddr = "203.0.113.9:1234".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        headers.insert("x-forwarded-for", "10.0.0.2, 10.0.0.3".parse().unwrap());
        assert_eq!(client_ip(&headers, remote), "10.0.0.1");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, remote), "10.0.0.2");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, remote), "203.0.113.9");
    }

    #[test]
    fn test_registry_skips_disabled() {
        let defs = vec![
            MiddlewareDef {
                name: "log".to_string(),
                kind: MiddlewareKind::Logging,
                enabled: true,
                order: 1,
                config: serde_yaml::Value::default(),
            },
            MiddlewareDef {
                name: "off".to_string(),
                kind: MiddlewareKind::Logging,
                enabled: false,
                order: 2,
                config: serde_yaml::Value::default(),
            },
        ];
        let registry = MiddlewareRegistry::build(&defs).unwrap();
        assert!(registry.get("log").is_some());
        assert!(registry.get("off").is_none());

        let chain = registry.resolve_route_chain(&["log".to_string(), "off".to_string()]);
        assert_eq!(chain.len(), 1);
    }
}
