use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Request, Response};
use std::collections::BTreeMap;
use tracing::debug;

use super::{Middleware, Next, RequestContext};
use crate::error::GatewayResult;

/// Sets a route's configured response headers when the response head comes
/// back through the chain. Appended after the route's named middleware so
/// it runs closest to the endpoint.
pub struct HeadersMiddleware {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HeadersMiddleware {
    pub fn new(headers: &BTreeMap<String, String>) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        debug!(header = %name, "Skipping unparseable route header");
                        None
                    }
                }
            })
            .collect();
        Self { headers }
    }
}

#[async_trait]
impl Middleware for HeadersMiddleware {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let mut response = next.run(req, ctx).await?;
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        "headers"
    }
}
