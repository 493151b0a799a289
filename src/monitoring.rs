//! Dedicated health and metrics listeners, separate from the proxy ports.

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{HealthConfig, MetricsConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthChecker;

/// Install the Prometheus exporter on the metrics port. The exporter owns
/// its own listener and serves the exposition format itself.
pub fn start_metrics_exporter(config: &MetricsConfig) -> GatewayResult<()> {
    if !config.enabled {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GatewayError::internal(format!("failed to install metrics exporter: {}", e)))?;

    info!(port = config.port, path = %config.path, "Metrics exporter started");
    Ok(())
}

/// Serve `/health` (liveness) and `/health/targets` (per-target state) on
/// the health port.
pub fn spawn_health_endpoint(config: &HealthConfig, checker: Arc<HealthChecker>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let checker = Arc::clone(&checker);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let checker = Arc::clone(&checker);
                async move { Ok::<_, Infallible>(health_response(&req, &checker)) }
            }))
        }
    });

    info!(port = config.port, "Health endpoint started");
    tokio::spawn(async move {
        if let Err(e) = Server::bind(&addr).serve(make_svc).await {
            error!(error = %e, "Health endpoint error");
        }
    });
}

fn health_response(req: &Request<Body>, checker: &HealthChecker) -> Response<Body> {
    if req.method() != Method::GET {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::empty())
            .unwrap_or_default();
    }

    match req.uri().path() {
        "/health" => json_response(serde_json::json!({ "status": "ok" })),
        "/health/targets" => {
            let reports = checker.reports();
            json_response(serde_json::json!({ "targets": reports }))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_default(),
    }
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}
