//! ACME certificate resolution.
//!
//! Issued certificates live per-host under the cache directory
//! (`<host>.crt` / `<host>.key`) and are loaded lazily at SNI time.
//! HTTP-01 challenge tokens are served from `<cache_dir>/acme-challenge/`
//! on the plain-HTTP listener, so the issuing agent only has to drop files
//! into the cache.

use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::AcmeConfig;
use crate::error::{GatewayError, GatewayResult};

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const PRODUCTION_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
const STAGING_DIRECTORY: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

pub struct AcmeResolver {
    config: AcmeConfig,
    cache_dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl AcmeResolver {
    pub fn new(config: AcmeConfig) -> GatewayResult<Self> {
        let cache_dir = PathBuf::from(&config.cache_dir);
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            GatewayError::tls(format!(
                "failed to create ACME cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;
        std::fs::create_dir_all(cache_dir.join("acme-challenge"))?;

        info!(
            cache_dir = %cache_dir.display(),
            directory = Self::directory_url_for(config.staging),
            hosts = ?config.hosts,
            "ACME resolver initialized"
        );

        Ok(Self {
            config,
            cache_dir,
            loaded: RwLock::new(HashMap::new()),
        })
    }

    pub fn directory_url(&self) -> &'static str {
        Self::directory_url_for(self.config.staging)
    }

    fn directory_url_for(staging: bool) -> &'static str {
        if staging {
            STAGING_DIRECTORY
        } else {
            PRODUCTION_DIRECTORY
        }
    }

    pub fn account_email(&self) -> &str {
        &self.config.email
    }

    /// Whether the host is on the configured whitelist.
    pub fn allows(&self, host: &str) -> bool {
        self.config.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Resolve a whitelisted host to a cached keypair, loading it from the
    /// cache directory on first use.
    pub fn resolve(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if !self.allows(host) {
            return None;
        }
        let host = host.to_ascii_lowercase();

        if let Some(key) = self.loaded.read().unwrap().get(&host) {
            return Some(Arc::clone(key));
        }

        let cert_file = self.cache_dir.join(format!("{}.crt", host));
        let key_file = self.cache_dir.join(format!("{}.key", host));
        match super::load_certified_key(&cert_file, &key_file) {
            Ok(key) => {
                debug!(host = %host, "Loaded ACME certificate from cache");
                let key = Arc::new(key);
                self.loaded
                    .write()
                    .unwrap()
                    .insert(host, Arc::clone(&key));
                Some(key)
            }
            Err(e) => {
                warn!(host = %host, error = %e, "No usable ACME certificate in cache");
                None
            }
        }
    }

    /// Body for `GET /.well-known/acme-challenge/<token>`, if the token file
    /// exists. Tokens containing path separators are rejected outright.
    pub fn challenge_response(&self, token: &str) -> Option<Vec<u8>> {
        if token.is_empty() || token.contains('/') || token.contains("..") {
            return None;
        }
        let path = self.cache_dir.join("acme-challenge").join(token);
        std::fs::read(path).ok()
    }

    /// Drop memoized keypairs so the next handshake re-reads the cache.
    pub fn reload(&self) {
        self.loaded.write().unwrap().clear();
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.cache_dir.join("acme-challenge")
    }

    #[allow(dead_code)]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl std::fmt::Debug for AcmeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeResolver")
            .field("hosts", &self.config.hosts)
            .field("staging", &self.config.staging)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}
