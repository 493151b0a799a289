use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration;

/// TLS settings (`tls.yaml`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,
}

/// ACME account and cache settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AcmeConfig {
    pub enabled: bool,
    #[serde(default)]
    pub email: String,
    /// Hosts eligible for ACME-issued certificates at SNI time.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub cache_dir: String,
    /// Use the Let's Encrypt staging directory instead of production.
    #[serde(default)]
    pub staging: bool,
}

/// One explicit certificate entry, optionally auto-generated self-signed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateEntry {
    pub hosts: Vec<String>,
    pub cert_file: String,
    pub key_file: String,
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default)]
    pub self_signed: bool,
    #[serde(default, with = "duration::option")]
    pub valid_for: Option<Duration>,
    #[serde(default)]
    pub rsa_bits: Option<u32>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}
