//! TLS certificate management: SNI-based selection over a certificate
//! store, fed by manual entries (optionally auto-generated self-signed)
//! and the ACME cache.

pub mod acme;
pub mod generator;
pub mod store;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::config::TlsConfig;
use crate::error::{GatewayError, GatewayResult};

pub use acme::{AcmeResolver, CHALLENGE_PATH_PREFIX};
pub use store::CertificateStore;

pub struct TlsManager {
    config: TlsConfig,
    store: Arc<CertificateStore>,
    acme: Option<Arc<AcmeResolver>>,
}

impl TlsManager {
    pub fn new(config: TlsConfig) -> GatewayResult<Self> {
        let acme = if config.enabled && config.acme.enabled {
            Some(Arc::new(AcmeResolver::new(config.acme.clone())?))
        } else {
            None
        };
        Ok(Self {
            config,
            store: Arc::new(CertificateStore::new()),
            acme,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn acme(&self) -> Option<Arc<AcmeResolver>> {
        self.acme.as_ref().map(Arc::clone)
    }

    pub fn store(&self) -> Arc<CertificateStore> {
        Arc::clone(&self.store)
    }

    /// Run the auto-generate path and load every manual entry into the
    /// store. Manual certificates must exist and be within their validity
    /// window; auto-generated ones are synthesized or renewed on demand.
    pub fn initialize(&self) -> GatewayResult<()> {
        if !self.config.enabled {
            debug!("TLS is disabled");
            return Ok(());
        }

        for (i, entry) in self.config.certificates.iter().enumerate() {
            if entry.auto_generate && entry.self_signed {
                generator::ensure_certificate(entry)
                    .map_err(|e| GatewayError::tls(format!("certificate {}: {}", i, e)))?;
            }

            let key = load_certified_key(
                Path::new(&entry.cert_file),
                Path::new(&entry.key_file),
            )
            .map_err(|e| GatewayError::tls(format!("certificate {}: {}", i, e)))?;
            let key = Arc::new(key);

            for host in &entry.hosts {
                self.store.insert(host, Arc::clone(&key));
                info!(
                    host = %host,
                    cert_file = %entry.cert_file,
                    auto_generated = entry.auto_generate,
                    "Loaded certificate"
                );
            }
        }

        metrics::gauge!("gatehouse_tls_certificates").set(self.store.len() as f64);
        Ok(())
    }

    /// Clear the store and re-run the auto-generate / load path.
    pub fn reload(&self) -> GatewayResult<()> {
        info!("Reloading certificates");
        self.store.clear();
        if let Some(acme) = &self.acme {
            acme.reload();
        }
        self.initialize()
    }

    /// rustls server configuration with the SNI resolver installed.
    pub fn server_config(&self, http2_enabled: bool) -> GatewayResult<Arc<ServerConfig>> {
        if !self.config.enabled {
            return Err(GatewayError::tls("TLS is disabled"));
        }
        if self.store.is_empty() && self.acme.is_none() {
            return Err(GatewayError::tls("no certificates available"));
        }

        let resolver = SniResolver {
            store: Arc::clone(&self.store),
            acme: self.acme.clone(),
        };

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));

        config.alpn_protocols = if http2_enabled {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        Ok(Arc::new(config))
    }
}

/// SNI-time certificate selection. Precedence: manual store, then the ACME
/// resolver for whitelisted hosts, then any certificate when the client
/// sent no SNI at all.
#[derive(Debug)]
struct SniResolver {
    store: Arc<CertificateStore>,
    acme: Option<Arc<AcmeResolver>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello
            .server_name()
            .map(|name| {
                let name = name.to_ascii_lowercase();
                match name.rfind(':') {
                    Some(idx) => name[..idx].to_string(),
                    None => name,
                }
            })
            .unwrap_or_default();

        if sni.is_empty() {
            return self.store.any();
        }

        if let Some(key) = self.store.get(&sni) {
            return Some(key);
        }

        if let Some(acme) = &self.acme {
            if let Some(key) = acme.resolve(&sni) {
                return Some(key);
            }
        }

        debug!(sni = %sni, "No certificate for SNI");
        None
    }
}

/// Load a PEM certificate chain and private key into a rustls
/// `CertifiedKey`, rejecting certificates outside their validity window.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> GatewayResult<CertifiedKey> {
    let cert_file = File::open(cert_path).map_err(|e| {
        GatewayError::io(format!(
            "failed to open certificate file {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| GatewayError::tls(format!("failed to parse certificate: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(GatewayError::tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    validate_validity_window(&cert_chain[0])?;

    let key_file = File::open(key_path).map_err(|e| {
        GatewayError::io(format!(
            "failed to open private key file {}: {}",
            key_path.display(),
            e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| GatewayError::tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| {
            GatewayError::tls(format!("no private keys found in {}", key_path.display()))
        })?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
        .map_err(|e| GatewayError::tls(format!("unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

fn validate_validity_window(cert: &rustls::pki_types::CertificateDer<'_>) -> GatewayResult<()> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| GatewayError::tls(format!("failed to parse certificate DER: {}", e)))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let validity = parsed.validity();
    if now < validity.not_before.timestamp() {
        return Err(GatewayError::tls(format!(
            "certificate not valid until {}",
            validity.not_before
        )));
    }
    if now > validity.not_after.timestamp() {
        return Err(GatewayError::tls(format!(
            "certificate expired at {}",
            validity.not_after
        )));
    }
    Ok(())
}
