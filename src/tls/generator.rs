//! Self-signed certificate generation for `auto_generate` entries.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::config::CertificateEntry;
use crate::error::{GatewayError, GatewayResult};

const DEFAULT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);
/// Certificates closer than this to expiry are regenerated.
const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

/// Regenerate the entry's certificate unless the files on disk already hold
/// a parseable keypair that is not expired and not about to expire.
pub fn ensure_certificate(entry: &CertificateEntry) -> GatewayResult<bool> {
    if certificate_is_usable(&entry.cert_file, &entry.key_file) {
        info!(
            cert_file = %entry.cert_file,
            key_file = %entry.key_file,
            "Valid certificate already exists"
        );
        return Ok(false);
    }
    generate_self_signed(entry)?;
    Ok(true)
}

/// Whether the files exist, parse, and are good for at least the renewal
/// window.
pub fn certificate_is_usable(cert_file: &str, key_file: &str) -> bool {
    if !Path::new(cert_file).exists() || !Path::new(key_file).exists() {
        return false;
    }

    let pem = match std::fs::read(cert_file) {
        Ok(pem) => pem,
        Err(_) => return false,
    };
    let der = match x509_parser::pem::parse_x509_pem(&pem) {
        Ok((_, pem)) => pem,
        Err(e) => {
            warn!(cert_file, error = %e, "Certificate file exists but is not valid PEM");
            return false;
        }
    };
    let cert = match der.parse_x509() {
        Ok(cert) => cert,
        Err(e) => {
            warn!(cert_file, error = %e, "Certificate file exists but does not parse");
            return false;
        }
    };

    let now = unix_now();
    let not_after = cert.validity().not_after.timestamp();
    if now > not_after || now + RENEWAL_WINDOW.as_secs() as i64 > not_after {
        info!(cert_file, "Certificate expired or expires soon");
        return false;
    }
    if now < cert.validity().not_before.timestamp() {
        return false;
    }

    // The key must at least be readable PEM
    std::fs::read(key_file)
        .ok()
        .map(|key| key.starts_with(b"-----BEGIN"))
        .unwrap_or(false)
}

/// Synthesize a keypair and X.509 certificate from the entry and write both
/// files: certificate 0644, private key 0600.
pub fn generate_self_signed(entry: &CertificateEntry) -> GatewayResult<()> {
    let valid_for = entry.valid_for.unwrap_or(DEFAULT_VALIDITY);
    let common_name = entry
        .common_name
        .clone()
        .or_else(|| entry.hosts.first().cloned())
        .unwrap_or_default();

    if let Some(bits) = entry.rsa_bits {
        // Key material comes from rcgen, which generates ECDSA P-256
        info!(rsa_bits = bits, "rsa_bits is accepted for compatibility; generated keys are ECDSA P-256");
    }

    info!(
        hosts = ?entry.hosts,
        valid_for = ?valid_for,
        cert_file = %entry.cert_file,
        "Generating self-signed certificate"
    );

    let key = KeyPair::generate()
        .map_err(|e| GatewayError::tls(format!("failed to generate key: {}", e)))?;

    let mut params = CertificateParams::default();
    // Serial 1 is acceptable for a self-signed certificate
    params.serial_number = Some(SerialNumber::from(vec![1u8]));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before
        + time::Duration::seconds(valid_for.as_secs().min(i64::MAX as u64) as i64);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(org) = &entry.organization {
        dn.push(DnType::OrganizationName, org.clone());
    }
    params.distinguished_name = dn;

    for host in &entry.hosts {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.clone()
                    .try_into()
                    .map_err(|e| GatewayError::tls(format!("invalid SAN host '{}': {}", host, e)))?,
            ),
        };
        params.subject_alt_names.push(san);
    }

    let cert = params
        .self_signed(&key)
        .map_err(|e| GatewayError::tls(format!("failed to create certificate: {}", e)))?;

    write_with_mode(&entry.cert_file, cert.pem().as_bytes(), 0o644)?;
    write_with_mode(&entry.key_file, key.serialize_pem().as_bytes(), 0o600)?;

    info!(
        cert_file = %entry.cert_file,
        key_file = %entry.key_file,
        "Self-signed certificate generated"
    );
    Ok(())
}

fn write_with_mode(path: &str, contents: &[u8], mode: u32) -> GatewayResult<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
