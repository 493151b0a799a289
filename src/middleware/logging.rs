use async_trait::async_trait;
use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, info};

use super::{Middleware, Next, RequestContext};
use crate::error::GatewayResult;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingParams {
    pub log_requests: bool,
    pub log_responses: bool,
    pub log_headers: bool,
}

impl Default for LoggingParams {
    fn default() -> Self {
        Self {
            log_requests: true,
            log_responses: true,
            log_headers: false,
        }
    }
}

/// Structured access logging.
pub struct LoggingMiddleware {
    params: LoggingParams,
}

impl LoggingMiddleware {
    pub fn new(params: LoggingParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let user_agent = req
            .headers()
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let proto = format!("{:?}", req.version());

        if self.params.log_requests {
            if self.params.log_headers {
                let headers: Vec<String> = req
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        format!("{}: {}", name, value.to_str().unwrap_or("<binary>"))
                    })
                    .collect();
                info!(
                    method = %method,
                    path = %path,
                    query = %query,
                    remote_addr = %ctx.remote_addr,
                    user_agent = %user_agent,
                    proto = %proto,
                    host = %host,
                    headers = ?headers,
                    "Request started"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    query = %query,
                    remote_addr = %ctx.remote_addr,
                    user_agent = %user_agent,
                    proto = %proto,
                    host = %host,
                    "Request started"
                );
            }
        }

        let response = next.run(req, ctx).await?;

        if self.params.log_responses {
            let status = response.status().as_u16();
            let bytes = response
                .headers()
                .get(hyper::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let duration = start.elapsed();

            if status >= 400 {
                error!(
                    method = %method,
                    path = %path,
                    status,
                    bytes,
                    duration_ms = duration.as_millis() as u64,
                    remote_addr = %ctx.remote_addr,
                    "Request completed with error"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status,
                    bytes,
                    duration_ms = duration.as_millis() as u64,
                    remote_addr = %ctx.remote_addr,
                    "Request completed"
                );
            }
        }

        Ok(response)
    }

    fn name(&self) -> &str {
        "logging"
    }
}
