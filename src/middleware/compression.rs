use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::body::HttpBody as _;
use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use std::io::Write;

use super::{Middleware, Next, RequestContext};
use crate::error::GatewayResult;

const DEFAULT_COMPRESSED_TYPES: &[&str] = &[
    "text/html",
    "text/plain",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/json",
    "application/xml",
    "text/xml",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionParams {
    /// gzip level, 0..=9.
    pub level: u32,
    /// Responses with a known length below this are left alone.
    pub min_length: u64,
    /// Content types eligible for compression (substring match).
    pub types: Vec<String>,
    pub skip_paths: Vec<String>,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            level: 6,
            min_length: 1024,
            types: DEFAULT_COMPRESSED_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            skip_paths: Vec::new(),
        }
    }
}

impl CompressionParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.level > 9 {
            return Err(format!("compression level must be 0..=9, got {}", self.level));
        }
        Ok(())
    }
}

/// gzip response compression negotiated via `Accept-Encoding`.
pub struct CompressionMiddleware {
    params: CompressionParams,
}

impl CompressionMiddleware {
    pub fn new(params: CompressionParams) -> GatewayResult<Self> {
        params
            .validate()
            .map_err(crate::error::GatewayError::config_validation)?;
        Ok(Self { params })
    }

    fn should_compress(&self, response: &Response<Body>) -> bool {
        if response.status().as_u16() >= 400 {
            return false;
        }

        let content_type = response
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !self
            .params
            .types
            .iter()
            .any(|candidate| content_type.contains(candidate.as_str()))
        {
            return false;
        }

        if let Some(length) = response
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            if length < self.params.min_length {
                return false;
            }
        }

        true
    }
}

#[async_trait]
impl Middleware for CompressionMiddleware {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let path = req.uri().path();
        if self
            .params
            .skip_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return next.run(req, ctx).await;
        }

        let accepts_gzip = req
            .headers()
            .get(hyper::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        if !accepts_gzip {
            return next.run(req, ctx).await;
        }

        let response = next.run(req, ctx).await?;
        if !self.should_compress(&response) {
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        parts.headers.insert(
            hyper::header::CONTENT_ENCODING,
            hyper::header::HeaderValue::from_static("gzip"),
        );
        parts.headers.insert(
            hyper::header::VARY,
            hyper::header::HeaderValue::from_static("Accept-Encoding"),
        );
        // Length changes under compression; the response becomes chunked
        parts.headers.remove(hyper::header::CONTENT_LENGTH);

        Ok(Response::from_parts(parts, gzip_body(body, self.params.level)))
    }

    fn name(&self) -> &str {
        "compression"
    }
}

/// Pipe a body through a gzip encoder chunk by chunk. Each input chunk is
/// sync-flushed through so streaming responses keep streaming; the encoder
/// is finished when the source ends, which emits the gzip trailer.
fn gzip_body(mut body: Body, level: u32) -> Body {
    let (mut sender, compressed) = Body::channel();

    tokio::spawn(async move {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        while let Some(chunk) = body.data().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(_) => {
                    sender.abort();
                    return;
                }
            };
            if encoder.write_all(&chunk).is_err() || encoder.flush().is_err() {
                sender.abort();
                return;
            }
            let buffered = std::mem::take(encoder.get_mut());
            if !buffered.is_empty() && sender.send_data(Bytes::from(buffered)).await.is_err() {
                return;
            }
        }

        match encoder.finish() {
            Ok(trailer) => {
                if !trailer.is_empty() {
                    let _ = sender.send_data(Bytes::from(trailer)).await;
                }
            }
            Err(_) => sender.abort(),
        }
    });

    compressed
}
