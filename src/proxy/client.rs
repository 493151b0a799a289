//! Shared outbound HTTP client and request dispatch.

use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use once_cell::sync::Lazy;
use std::time::Duration;
use tracing::debug;

use crate::balancer::TargetRuntime;
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::RequestContext;

/// Single pooled client reused for every upstream dispatch, HTTP and HTTPS.
static SHARED_CLIENT: Lazy<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>> =
    Lazy::new(|| {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build::<_, Body>(https)
    });

/// Forward a request to the selected target with the rewritten path,
/// preserving method, body and headers. Upgrade requests (WebSocket and
/// friends) pass through transparently: on a 101 from the backend both
/// sides are upgraded and bridged byte-for-byte. Transport failures
/// surface as `BackendTransport` (502).
pub async fn dispatch(
    mut req: Request<Body>,
    target: &TargetRuntime,
    rewritten_path: &str,
    ctx: &RequestContext,
) -> GatewayResult<Response<Body>> {
    let downstream_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let upgrade_proto = req.headers().get(UPGRADE).cloned();

    let (mut parts, body) = req.into_parts();

    let base = target.uri();
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| GatewayError::transport(target.url(), "target URI missing authority"))?;

    // Join the target's base path (if any) with the rewritten request path
    let base_path = base.path().trim_end_matches('/');
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let upstream_uri: Uri = format!("{}://{}{}{}{}", scheme, authority, base_path, rewritten_path, query)
        .parse()
        .map_err(|e| GatewayError::transport(target.url(), format!("invalid upstream uri: {}", e)))?;
    parts.uri = upstream_uri;

    strip_hop_by_hop_headers(&mut parts.headers);

    // Upgrade is hop-by-hop, but an upgrade request must carry it onward
    if let (Some(_), Some(proto)) = (&downstream_upgrade, upgrade_proto) {
        parts.headers.insert(UPGRADE, proto);
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    }

    parts.headers.insert(
        HOST,
        authority
            .as_str()
            .parse()
            .map_err(|_| GatewayError::transport(target.url(), "bad host header"))?,
    );

    // Append the client IP to any existing X-Forwarded-For chain
    let forwarded = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ctx.client_ip),
        _ => ctx.client_ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        parts.headers.insert("x-forwarded-for", value);
    }
    parts.headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if ctx.scheme == "https" { "https" } else { "http" }),
    );

    let upstream_req = Request::from_parts(parts, body);
    let mut upstream_res = SHARED_CLIENT
        .request(upstream_req)
        .await
        .map_err(|e| GatewayError::transport(target.url(), e.to_string()))?;

    if upstream_res.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(downstream) = downstream_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);
            let target_url = target.url().to_string();
            tokio::spawn(async move {
                let mut downstream = match downstream.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(error = %e, "Client upgrade failed");
                        return;
                    }
                };
                let mut upstream = match upstream_upgrade.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(target = %target_url, error = %e, "Backend upgrade failed");
                        return;
                    }
                };
                let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
            });
        }
        // A 101 keeps its Connection/Upgrade headers; hyper finishes the
        // handshake with the client from here
        return Ok(upstream_res);
    }

    Ok(sanitize_response(upstream_res))
}

fn sanitize_response(upstream: Response<Body>) -> Response<Body> {
    let (mut parts, body) = upstream.into_parts();
    let hop: Vec<hyper::header::HeaderName> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        parts.headers.remove(name);
    }
    Response::from_parts(parts, body)
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    // If the Connection header named additional hop-by-hop headers, those
    // go too
    let extra: Vec<String> = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default();

    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
    for name in extra {
        headers.remove(name.as_str());
    }
}
