use async_trait::async_trait;
use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::warn;

use super::{Middleware, Next, RequestContext};
use crate::error::GatewayResult;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitParams {
    pub requests_per_second: f64,
    pub burst: f64,
    pub key_func: KeyFunc,
}

impl Default for RateLimitParams {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20.0,
            key_func: KeyFunc::Ip,
        }
    }
}

impl RateLimitParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_second <= 0.0 {
            return Err("requests_per_second must be positive".to_string());
        }
        if self.burst <= 0.0 {
            return Err("burst must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFunc {
    Ip,
    User,
    Global,
}

/// One key's token bucket. Refilled lazily on each decision.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Non-blocking take: refill for elapsed time, then spend one token if
    /// available. Decisions for a single key are linearized by the lock.
    fn allow(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets per key, lazily created under the double-checked pattern.
pub struct RateLimiterRegistry {
    rate: f64,
    burst: f64,
    limiters: RwLock<HashMap<String, Mutex<TokenBucket>>>,
}

impl RateLimiterRegistry {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        {
            let limiters = self.limiters.read().unwrap();
            if let Some(bucket) = limiters.get(key) {
                return bucket.lock().unwrap().allow(self.rate, self.burst);
            }
        }

        let mut limiters = self.limiters.write().unwrap();
        // Re-check under the write lock; another request may have inserted
        let bucket = limiters
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::full(self.burst)));
        let allowed = bucket.lock().unwrap().allow(self.rate, self.burst);
        allowed
    }

    /// Prune idle keys, approximated as buckets that have refilled to full.
    pub fn cleanup(&self) {
        let mut limiters = self.limiters.write().unwrap();
        let rate = self.rate;
        let burst = self.burst;
        limiters.retain(|_, bucket| {
            let mut bucket = bucket.lock().unwrap();
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            let current = (bucket.tokens + elapsed * rate).min(burst);
            bucket.tokens = current;
            bucket.last_refill = Instant::now();
            current < burst
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.limiters.read().unwrap().len()
    }
}

/// Token-bucket rate limiting per client key.
pub struct RateLimitMiddleware {
    params: RateLimitParams,
    registry: RateLimiterRegistry,
}

impl RateLimitMiddleware {
    pub fn new(params: RateLimitParams) -> GatewayResult<Self> {
        params
            .validate()
            .map_err(crate::error::GatewayError::config_validation)?;
        let registry = RateLimiterRegistry::new(params.requests_per_second, params.burst);
        Ok(Self { params, registry })
    }

    fn key(&self, req: &Request<Body>, ctx: &RequestContext) -> String {
        match self.params.key_func {
            KeyFunc::Ip => ctx.client_ip.clone(),
            KeyFunc::User => req
                .headers()
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(String::from)
                .unwrap_or_else(|| ctx.client_ip.clone()),
            KeyFunc::Global => "global".to_string(),
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let key = self.key(&req, ctx);

        if !self.registry.allow(&key) {
            warn!(
                key = %key,
                remote_addr = %ctx.remote_addr,
                path = req.uri().path(),
                "Rate limit exceeded"
            );
            metrics::counter!("gatehouse_rate_limited_total").increment(1);

            return Ok(Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header(
                    "X-RateLimit-Limit",
                    format!("{:.2}", self.params.requests_per_second),
                )
                .header("X-RateLimit-Remaining", "0")
                .header("Retry-After", "1")
                .body(Body::from("Rate limit exceeded"))?);
        }

        next.run(req, ctx).await
    }

    fn name(&self) -> &str {
        "rate_limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{test_ctx, StaticEndpoint};
    use crate::middleware::Chain;
    use std::sync::Arc;

    fn middleware(rps: f64, burst: f64, key_func: KeyFunc) -> RateLimitMiddleware {
        RateLimitMiddleware::new(RateLimitParams {
            requests_per_second: rps,
            burst,
            key_func,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_burst_one_denies_second_request() {
        let chain = Chain::new(vec![Arc::new(middleware(1.0, 1.0, KeyFunc::Ip))]);
        let endpoint = StaticEndpoint::new(StatusCode::OK, "ok");
        let ctx = test_ctx();

        let first = chain
            .run(Request::new(Body::empty()), &ctx, &endpoint)
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = chain
            .run(Request::new(Body::empty()), &ctx, &endpoint)
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["X-RateLimit-Remaining"], "0");
        assert_eq!(second.headers()["Retry-After"], "1");
        assert_eq!(second.headers()["X-RateLimit-Limit"], "1.00");

        // The denied request never reached the endpoint
        assert_eq!(endpoint.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_ips_have_distinct_buckets() {
        let mw = middleware(1.0, 1.0, KeyFunc::Ip);

        assert!(mw.registry.allow("10.0.0.1"));
        assert!(!mw.registry.allow("10.0.0.1"));
        assert!(mw.registry.allow("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_user_key_falls_back_to_ip() {
        let mw = middleware(10.0, 20.0, KeyFunc::User);
        let ctx = test_ctx();

        let anonymous = Request::new(Body::empty());
        assert_eq!(mw.key(&anonymous, &ctx), ctx.client_ip);

        let identified = Request::builder()
            .header("x-user-id", "u-42")
            .body(Body::empty())
            .unwrap();
        assert_eq!(mw.key(&identified, &ctx), "u-42");
    }

    #[test]
    fn test_global_key_is_constant() {
        let mw = middleware(10.0, 20.0, KeyFunc::Global);
        let ctx = test_ctx();
        assert_eq!(mw.key(&Request::new(Body::empty()), &ctx), "global");
    }

    #[test]
    fn test_cleanup_prunes_full_buckets() {
        let registry = RateLimiterRegistry::new(1000.0, 2.0);
        assert!(registry.allow("a"));
        assert_eq!(registry.len(), 1);

        // At 1000 tokens/s the bucket refills to burst almost immediately
        std::thread::sleep(std::time::Duration::from_millis(10));
        registry.cleanup();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let params = RateLimitParams {
            requests_per_second: 0.0,
            burst: 1.0,
            key_func: KeyFunc::Ip,
        };
        assert!(params.validate().is_err());
    }
}
