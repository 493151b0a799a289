use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Hostname → keypair map behind a reader-writer lock. Handshakes only ever
/// take the read side; reloads take the single writer.
pub struct CertificateStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .read()
            .unwrap()
            .get(&host.to_ascii_lowercase())
            .map(Arc::clone)
    }

    pub fn insert(&self, host: &str, key: Arc<CertifiedKey>) {
        self.certs
            .write()
            .unwrap()
            .insert(host.to_ascii_lowercase(), key);
    }

    /// Any one certificate, used as the default when the client sent no SNI.
    pub fn any(&self) -> Option<Arc<CertifiedKey>> {
        self.certs.read().unwrap().values().next().map(Arc::clone)
    }

    pub fn clear(&self) {
        self.certs.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.certs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hosts(&self) -> Vec<String> {
        self.certs.read().unwrap().keys().cloned().collect()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hosts", &self.hosts())
            .finish()
    }
}
