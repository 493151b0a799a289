//! Per-request orchestration: route, rewrite, select, compose the route's
//! middleware chain around the dispatch endpoint, and retry on 5xx.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{Body, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::client;
use crate::balancer::{Balancer, TargetRuntime};
use crate::config::RetryPolicy;
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::{Chain, Endpoint, RequestContext};
use crate::snapshot::Snapshot;

pub struct ProxyEngine {
    snapshot: Arc<ArcSwap<Snapshot>>,
}

impl ProxyEngine {
    pub fn new(snapshot: Arc<ArcSwap<Snapshot>>) -> Self {
        Self { snapshot }
    }

    /// Serve one request. Never fails: every error becomes its mapped HTTP
    /// response.
    pub async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Response<Body> {
        let started = Instant::now();
        // One snapshot load per request; everything below reads this view
        let snapshot = self.snapshot.load_full();

        let ctx = RequestContext::new(remote_addr, req.headers(), scheme);
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let response = match self.dispatch(&snapshot, req, &ctx, &host, &path).await {
            Ok(response) => response,
            Err(e) => error_response(&e, &method.to_string(), &path, &host),
        };

        metrics::counter!(
            "gatehouse_requests_total",
            "status" => response.status().as_u16().to_string()
        )
        .increment(1);
        metrics::histogram!("gatehouse_request_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        response
    }

    async fn dispatch(
        &self,
        snapshot: &Snapshot,
        req: Request<Body>,
        ctx: &RequestContext,
        host: &str,
        path: &str,
    ) -> GatewayResult<Response<Body>> {
        let route = snapshot
            .router
            .match_request(host, path, req.method())
            .ok_or_else(|| GatewayError::NoMatchingRoute {
                host: host.to_string(),
                path: path.to_string(),
            })?;

        let rewritten = route.rewriter.apply(path)?;
        if rewritten != path {
            debug!(original = %path, rewritten = %rewritten, "Applied rewrite");
        }

        let upstream = snapshot
            .upstreams
            .get(&route.rule.upstream)
            .ok_or_else(|| GatewayError::UpstreamUnknown {
                name: route.rule.upstream.clone(),
            })?;

        // Selection happens once; retries hit the same target
        let views = upstream.pool.snapshot();
        let target = upstream.balancer.select(&views, &ctx.client_ip)?;
        debug!(
            upstream = %upstream.name,
            target = target.url(),
            strategy = upstream.balancer.name(),
            "Selected target"
        );

        let endpoint = DispatchEndpoint {
            target,
            balancer: Arc::clone(&upstream.balancer),
            path: rewritten,
        };
        let route_chain = &snapshot.route_chains[route.index];

        let work = execute_with_retry(
            &route_chain.chain,
            &route_chain.retry,
            req,
            ctx,
            &endpoint,
        );

        // The route timeout bounds the whole handler, retries included
        match route_chain.timeout {
            Some(limit) if !limit.is_zero() => {
                match tokio::time::timeout(limit, work).await {
                    Ok(response) => Ok(response),
                    Err(_) => Err(GatewayError::timeout(limit, "route handler")),
                }
            }
            _ => Ok(work.await),
        }
    }
}

/// Run the chain once, or up to `attempts + 1` times while the captured
/// status is ≥ 500, sleeping the constant backoff between attempts. Errors
/// are normalized to their HTTP mapping first, so a transport failure (502)
/// is retried like any other 5xx. With retries armed, the request body is
/// buffered up-front so every attempt replays identical bytes.
pub(crate) async fn execute_with_retry(
    chain: &Chain,
    retry: &RetryPolicy,
    req: Request<Body>,
    ctx: &RequestContext,
    endpoint: &dyn Endpoint,
) -> Response<Body> {
    if retry.attempts == 0 {
        return normalize(chain.run(req, ctx, endpoint).await);
    }

    let (parts, body) = req.into_parts();
    let buffered = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return plain_response(StatusCode::BAD_GATEWAY);
        }
    };

    let total = retry.attempts + 1;
    let mut attempt = 0;
    loop {
        let req = rebuild_request(&parts, buffered.clone());
        let response = normalize(chain.run(req, ctx, endpoint).await);

        if response.status().as_u16() < 500 {
            if attempt > 0 {
                info!(
                    attempts = attempt + 1,
                    status = response.status().as_u16(),
                    "Request succeeded after retries"
                );
            }
            return response;
        }
        if attempt + 1 >= total {
            return response;
        }

        warn!(
            attempt = attempt + 1,
            max_attempts = total,
            status = response.status().as_u16(),
            backoff = ?retry.backoff,
            "Request failed, retrying"
        );
        tokio::time::sleep(retry.backoff).await;
        attempt += 1;
    }
}

fn rebuild_request(parts: &Parts, body: Bytes) -> Request<Body> {
    let mut req = Request::new(Body::from(body));
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    req
}

fn normalize(result: GatewayResult<Response<Body>>) -> Response<Body> {
    match result {
        Ok(response) => response,
        Err(e) => {
            debug!(kind = e.kind(), error = %e, "Handler error normalized to response");
            plain_response(e.status_code())
        }
    }
}

fn plain_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(status.canonical_reason().unwrap_or("error")))
        .unwrap_or_default()
}

pub(crate) fn error_response(
    err: &GatewayError,
    method: &str,
    path: &str,
    host: &str,
) -> Response<Body> {
    let status = err.status_code();
    if status.is_server_error() {
        warn!(kind = err.kind(), method, path, host, error = %err, "Request failed");
    } else {
        debug!(kind = err.kind(), method, path, host, error = %err, "Request rejected");
    }
    plain_response(status)
}

/// The innermost handler: accounts inflight on the selected target and
/// streams the exchange with the backend. The guard decrements on every
/// exit path, panics and cancellation included.
struct DispatchEndpoint {
    target: Arc<TargetRuntime>,
    balancer: Arc<dyn Balancer>,
    path: String,
}

struct InflightGuard {
    target: Arc<TargetRuntime>,
    balancer: Arc<dyn Balancer>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.balancer.update(&self.target, -1);
    }
}

#[async_trait]
impl Endpoint for DispatchEndpoint {
    async fn call(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
    ) -> GatewayResult<Response<Body>> {
        self.balancer.update(&self.target, 1);
        let _guard = InflightGuard {
            target: Arc::clone(&self.target),
            balancer: Arc::clone(&self.balancer),
        };
        client::dispatch(req, &self.target, &self.path, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures::write_config_dir;
    use crate::config::Config;
    use crate::middleware::test_support::test_ctx;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn engine() -> ProxyEngine {
        let (_guard, dir) = write_config_dir();
        let config = Config::from_dir(&dir).await.unwrap();
        let snapshot = Snapshot::build(config, None, 1).unwrap();
        ProxyEngine::new(Arc::new(ArcSwap::from(snapshot)))
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("http://{}{}", host, path))
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    fn remote() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_route_is_404() {
        let engine = engine().await;
        let resp = engine
            .handle(request("localhost", "/nope"), remote(), "http")
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_all_unhealthy_is_503() {
        let (_guard, dir) = write_config_dir();
        let config = Config::from_dir(&dir).await.unwrap();
        let snapshot = Snapshot::build(config, None, 1).unwrap();
        for target in snapshot.upstreams["api-service"].pool.targets() {
            target.set_health_state(crate::health::HealthState::Unhealthy);
        }
        let engine = ProxyEngine::new(Arc::new(ArcSwap::from(snapshot)));

        let resp = engine
            .handle(request("localhost", "/api/v1/users"), remote(), "http")
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502_after_retries() {
        // Fixture targets point at 127.0.0.1:9001/9002 where nothing
        // listens, and the route retries twice with a 10ms backoff.
        let engine = engine().await;
        let resp = engine
            .handle(request("localhost", "/api/v1/users"), remote(), "http")
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_method_filter_applies() {
        let engine = engine().await;
        let req = Request::builder()
            .method(hyper::Method::DELETE)
            .uri("http://localhost/api/v1/users")
            .header(HOST, "localhost")
            .body(Body::empty())
            .unwrap();
        let resp = engine.handle(req, remote(), "http").await;
        // Route only allows GET and POST
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    struct FlakyEndpoint {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    #[async_trait]
    impl Endpoint for FlakyEndpoint {
        async fn call(
            &self,
            _req: Request<Body>,
            _ctx: &RequestContext,
        ) -> GatewayResult<Response<Body>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Ok(plain_response(StatusCode::SERVICE_UNAVAILABLE))
            } else {
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("finally"))?)
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_after_5xx() {
        // 503, 503, then 200: client sees 200, endpoint saw 3 calls
        let endpoint = FlakyEndpoint {
            calls: AtomicU32::new(0),
            failures_before_success: 2,
        };
        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(10),
        };
        let req = Request::builder().body(Body::from("payload")).unwrap();

        let resp =
            execute_with_retry(&Chain::default(), &retry, req, &test_ctx(), &endpoint).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_response() {
        let endpoint = FlakyEndpoint {
            calls: AtomicU32::new(0),
            failures_before_success: 10,
        };
        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let req = Request::builder().body(Body::empty()).unwrap();

        let resp =
            execute_with_retry(&Chain::default(), &retry, req, &test_ctx(), &endpoint).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_5xx_is_final() {
        let endpoint = FlakyEndpoint {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
        };
        let retry = RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(1),
        };
        let req = Request::builder().body(Body::empty()).unwrap();

        let resp =
            execute_with_retry(&Chain::default(), &retry, req, &test_ctx(), &endpoint).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }
}
