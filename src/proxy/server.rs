//! The inbound listeners: plaintext HTTP, and TLS-terminating HTTPS with
//! SNI certificate selection and optional ALPN h2.

use hyper::server::conn::{AddrStream, Http};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::engine::ProxyEngine;
use crate::config::Config;
use crate::error::GatewayResult;
use crate::tls::{TlsManager, CHALLENGE_PATH_PREFIX};

/// How long in-flight requests get to finish once shutdown begins.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

pub struct ProxyServer {
    http_port: u16,
    https_port: u16,
    read_timeout: Duration,
    http2_enabled: bool,
    engine: Arc<ProxyEngine>,
    tls: Option<Arc<TlsManager>>,
}

impl ProxyServer {
    pub fn new(config: &Config, engine: Arc<ProxyEngine>, tls: Option<Arc<TlsManager>>) -> Self {
        Self {
            http_port: config.global.server.http_port,
            https_port: config.global.server.https_port,
            read_timeout: config.global.server.read_timeout,
            http2_enabled: config.global.server.http2_enabled,
            engine,
            tls,
        }
    }

    /// Run both listeners until the shutdown signal fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let http = {
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run_http(shutdown).await })
        };

        let https = match &self.tls {
            Some(tls) if tls.is_enabled() => {
                let server = Arc::clone(&self);
                let config = tls.server_config(self.http2_enabled)?;
                let shutdown = shutdown.clone();
                Some(tokio::spawn(async move {
                    server.run_https(config, shutdown).await
                }))
            }
            _ => None,
        };

        http.await??;
        if let Some(https) = https {
            https.await??;
        }
        Ok(())
    }

    async fn run_http(&self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let engine = Arc::clone(&self.engine);
        let acme = self.tls.as_ref().and_then(|tls| tls.acme());

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote = conn.remote_addr();
            let engine = Arc::clone(&engine);
            let acme = acme.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let engine = Arc::clone(&engine);
                    let acme = acme.clone();
                    async move {
                        // HTTP-01 challenges are answered before routing
                        if let Some(acme) = &acme {
                            if let Some(token) =
                                req.uri().path().strip_prefix(CHALLENGE_PATH_PREFIX)
                            {
                                return Ok::<_, Infallible>(challenge_response(
                                    acme.challenge_response(token),
                                ));
                            }
                        }
                        Ok::<_, Infallible>(engine.handle(req, remote, "http").await)
                    }
                }))
            }
        });

        info!(port = self.http_port, "Starting HTTP server");
        let server = Server::bind(&addr)
            .http1_header_read_timeout(self.read_timeout)
            .tcp_nodelay(true)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

        if let Err(e) = server.await {
            error!(error = %e, "HTTP server error");
        }
        info!("HTTP server drained");
        Ok(())
    }

    async fn run_https(
        &self,
        config: Arc<rustls::ServerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.https_port));
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let listener = TcpListener::bind(&addr).await?;

        info!(
            port = self.https_port,
            http2 = self.http2_enabled,
            "Starting HTTPS server"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp_stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let engine = Arc::clone(&self.engine);
                    connections.spawn(async move {
                        let tls_stream = match acceptor.accept(tcp_stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                debug!(remote = %remote, error = %e, "TLS handshake failed");
                                return;
                            }
                        };

                        let service = service_fn(move |req: Request<Body>| {
                            let engine = Arc::clone(&engine);
                            async move {
                                Ok::<_, Infallible>(engine.handle(req, remote, "https").await)
                            }
                        });

                        if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                            debug!(remote = %remote, error = %e, "Error serving HTTPS connection");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        // Stop accepting, then give in-flight connections the drain window
        drop(listener);
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            warn!("Drain deadline reached, aborting remaining HTTPS connections");
            connections.abort_all();
        }
        info!("HTTPS server drained");
        Ok(())
    }
}

fn challenge_response(body: Option<Vec<u8>>) -> Response<Body> {
    match body {
        Some(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Body::from(body))
            .unwrap_or_default(),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not found"))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_response_mapping() {
        let hit = challenge_response(Some(b"token.auth".to_vec()));
        assert_eq!(hit.status(), StatusCode::OK);

        let miss = challenge_response(None);
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }
}
