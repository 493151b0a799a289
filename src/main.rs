use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse::config::{Config, ConfigSupervisor};
use gatehouse::health::HealthChecker;
use gatehouse::monitoring;
use gatehouse::proxy::{ProxyEngine, ProxyServer, DRAIN_DEADLINE};
use gatehouse::tls::TlsManager;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "A hot-reloadable reverse HTTP proxy")]
struct Args {
    /// Configuration directory
    #[arg(short, long, default_value = "./configs/default")]
    config: String,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before installing the subscriber so the log
    // format setting can take effect
    let config = Config::from_dir(&args.config)
        .await
        .context("failed to load configuration")?;

    init_tracing(&args.log_level, &config.global.log.format);
    info!(config_dir = %args.config, "Configuration loaded and validated");

    // TLS init happens up front: bad certificates abort startup
    let tls = if config.tls.enabled {
        let manager = Arc::new(TlsManager::new(config.tls.clone())?);
        manager.initialize().context("TLS initialization failed")?;
        Some(manager)
    } else {
        None
    };

    let health = Arc::new(HealthChecker::new(config.health.clone()));

    let mut supervisor = ConfigSupervisor::bootstrap(&args.config, Arc::clone(&health))
        .await
        .context("failed to build initial snapshot")?;

    monitoring::start_metrics_exporter(&config.metrics)?;
    monitoring::spawn_health_endpoint(&config.health, Arc::clone(&health));

    let health_handle = Arc::clone(&health).start();
    supervisor.start().context("failed to start config watcher")?;

    let engine = Arc::new(ProxyEngine::new(supervisor.snapshot_handle()));
    let server = Arc::new(ProxyServer::new(&config, engine, tls));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(Arc::clone(&server).run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    // Listeners stop accepting immediately; in-flight requests get the
    // drain window before we give up on them
    match tokio::time::timeout(DRAIN_DEADLINE, server_task).await {
        Ok(result) => result??,
        Err(_) => warn!("Shutdown deadline reached before all requests drained"),
    }

    health_handle.stop().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gatehouse={}", level)));

    if format == "text" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
