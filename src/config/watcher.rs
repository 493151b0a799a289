//! The config supervisor: watches the configuration directory and swaps in
//! validated snapshots atomically. A reload that fails to load or validate
//! leaves the live snapshot untouched.

use arc_swap::ArcSwap;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Config;
use crate::error::GatewayResult;
use crate::health::HealthChecker;
use crate::snapshot::Snapshot;

pub struct ConfigSupervisor {
    dir: PathBuf,
    snapshot: Arc<ArcSwap<Snapshot>>,
    health: Arc<HealthChecker>,
    version: Arc<AtomicU64>,
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigSupervisor {
    /// Load the initial configuration and publish snapshot v1.
    pub async fn bootstrap<P: AsRef<Path>>(
        dir: P,
        health: Arc<HealthChecker>,
    ) -> GatewayResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = Config::from_dir(&dir).await?;
        let snapshot = Snapshot::build(config, None, 1)?;
        health.register_targets(snapshot.health_entries());

        Ok(Self {
            dir,
            snapshot: Arc::new(ArcSwap::from(snapshot)),
            health,
            version: Arc::new(AtomicU64::new(1)),
            _watcher: None,
        })
    }

    /// The pointer the request path reads, one load per request.
    pub fn snapshot_handle(&self) -> Arc<ArcSwap<Snapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Start watching the directory for write events.
    pub fn start(&mut self) -> GatewayResult<()> {
        let (tx, mut rx) = mpsc::channel::<Event>(64);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => error!(error = %e, "File watch error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        info!(config_dir = %self.dir.display(), "Watching configuration directory");

        let dir = self.dir.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let health = Arc::clone(&self.health);
        let version = Arc::clone(&self.version);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !is_relevant(&event) {
                    continue;
                }
                debug!(?event, "Configuration change detected");

                // Let the writing editor finish, then fold queued events
                // into this one reload
                tokio::time::sleep(Duration::from_millis(100)).await;
                while rx.try_recv().is_ok() {}

                reload(&dir, &snapshot, &health, &version).await;
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }

    /// One reload cycle, callable directly (used by tests and SIGHUP-style
    /// tooling).
    pub async fn reload_now(&self) {
        reload(&self.dir, &self.snapshot, &self.health, &self.version).await;
    }
}

fn is_relevant(event: &Event) -> bool {
    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.extension().map(|ext| ext == "yaml" || ext == "yml").unwrap_or(false))
}

async fn reload(
    dir: &Path,
    snapshot: &ArcSwap<Snapshot>,
    health: &HealthChecker,
    version: &AtomicU64,
) {
    let config = match Config::from_dir(dir).await {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Reload failed, keeping current configuration");
            return;
        }
    };

    let previous = snapshot.load_full();
    let next_version = version.fetch_add(1, Ordering::SeqCst) + 1;
    let next = match Snapshot::build(config, Some(&previous), next_version) {
        Ok(next) => next,
        Err(e) => {
            warn!(error = %e, "Snapshot build failed, keeping current configuration");
            return;
        }
    };

    snapshot.store(next);
    let current = snapshot.load();
    health.register_targets(current.health_entries());
    metrics::counter!("gatehouse_config_reloads_total").increment(1);
    info!(version = next_version, "Configuration hot-reloaded");
}
