//! Certificate storage: the host's own TLS identity and the pinned
//! certificates of paired peers.
//!
//! Pairing pins the peer's exact certificate (trust-on-first-use, no CA
//! chains). The TLS verifiers compare DER bytes against the pinned copy;
//! everything here is plain storage.

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Invalid PEM data in {0}")]
    InvalidPem(String),
}

/// The host's own certificate and private key.
pub struct HostIdentity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for HostIdentity {
    fn clone(&self) -> Self {
        Self { cert: self.cert.clone(), key: self.key.clone_key() }
    }
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Storage for the host identity and per-peer pinned certificates.
pub trait TrustStore: Send + Sync {
    /// The host's certificate and key, generated on first use.
    fn host_identity(&self) -> Result<HostIdentity, TrustError>;

    /// The pinned certificate for a paired peer, if any.
    fn trusted_certificate(&self, peer_id: &str) -> Option<CertificateDer<'static>>;

    fn pin(&self, peer_id: &str, cert: &CertificateDer<'_>) -> Result<(), TrustError>;

    fn unpin(&self, peer_id: &str) -> Result<(), TrustError>;
}

fn generate_identity(common_name: &str) -> Result<HostIdentity, TrustError> {
    let generated = rcgen::generate_simple_self_signed(vec![common_name.to_string()])
        .map_err(|e| TrustError::Generation(e.to_string()))?;
    let cert = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));
    Ok(HostIdentity { cert, key })
}

/// In-memory store, used by tests.
pub struct MemoryTrustStore {
    common_name: String,
    identity: Mutex<Option<HostIdentity>>,
    pinned: Mutex<HashMap<String, CertificateDer<'static>>>,
}

impl MemoryTrustStore {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            identity: Mutex::new(None),
            pinned: Mutex::new(HashMap::new()),
        }
    }
}

impl TrustStore for MemoryTrustStore {
    fn host_identity(&self) -> Result<HostIdentity, TrustError> {
        let mut slot = self.identity.lock();
        if let Some(identity) = slot.as_ref() {
            return Ok(identity.clone());
        }
        let identity = generate_identity(&self.common_name)?;
        *slot = Some(identity.clone());
        Ok(identity)
    }

    fn trusted_certificate(&self, peer_id: &str) -> Option<CertificateDer<'static>> {
        self.pinned.lock().get(peer_id).cloned()
    }

    fn pin(&self, peer_id: &str, cert: &CertificateDer<'_>) -> Result<(), TrustError> {
        self.pinned
            .lock()
            .insert(peer_id.to_string(), cert.clone().into_owned());
        Ok(())
    }

    fn unpin(&self, peer_id: &str) -> Result<(), TrustError> {
        self.pinned.lock().remove(peer_id);
        Ok(())
    }
}

/// PEM files under the data directory. The host identity lives in
/// `identity.cert.pem` / `identity.key.pem`; pinned peer certificates in
/// `certs/<peer_id>.pem` (device ids are alphanumeric, so safe as file
/// names).
pub struct FileTrustStore {
    dir: PathBuf,
    common_name: String,
    cache: Mutex<HashMap<String, CertificateDer<'static>>>,
}

impl FileTrustStore {
    pub fn new(dir: impl Into<PathBuf>, common_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            common_name: common_name.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cert_path(&self) -> PathBuf {
        self.dir.join("identity.cert.pem")
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("identity.key.pem")
    }

    fn peer_path(&self, peer_id: &str) -> PathBuf {
        self.dir.join("certs").join(format!("{peer_id}.pem"))
    }

    fn read_cert_pem(path: &PathBuf) -> Result<CertificateDer<'static>, TrustError> {
        let data = fs::read(path)?;
        let mut reader = std::io::BufReader::new(data.as_slice());
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .transpose()
            .ok()
            .flatten();
        cert.ok_or_else(|| TrustError::InvalidPem(path.display().to_string()))
    }

    fn write_cert_pem(path: &PathBuf, cert: &CertificateDer<'_>) -> Result<(), TrustError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pem = pem_encode("CERTIFICATE", cert.as_ref());
        fs::write(path, pem)?;
        Ok(())
    }
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

impl TrustStore for FileTrustStore {
    fn host_identity(&self) -> Result<HostIdentity, TrustError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        if cert_path.exists() && key_path.exists() {
            let cert = Self::read_cert_pem(&cert_path)?;
            let key_data = fs::read(&key_path)?;
            let mut reader = std::io::BufReader::new(key_data.as_slice());
            let key = rustls_pemfile::private_key(&mut reader).ok().flatten();
            let key = key
                .ok_or_else(|| TrustError::InvalidPem(key_path.display().to_string()))?;
            return Ok(HostIdentity { cert, key });
        }

        tracing::info!("Generating new TLS identity for {}", self.common_name);
        let generated = rcgen::generate_simple_self_signed(vec![self.common_name.clone()])
            .map_err(|e| TrustError::Generation(e.to_string()))?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&cert_path, generated.cert.pem())?;
        fs::write(&key_path, generated.key_pair.serialize_pem())?;

        let cert = generated.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.key_pair.serialize_der(),
        ));
        Ok(HostIdentity { cert, key })
    }

    fn trusted_certificate(&self, peer_id: &str) -> Option<CertificateDer<'static>> {
        if let Some(cert) = self.cache.lock().get(peer_id) {
            return Some(cert.clone());
        }
        let path = self.peer_path(peer_id);
        if !path.exists() {
            return None;
        }
        match Self::read_cert_pem(&path) {
            Ok(cert) => {
                self.cache.lock().insert(peer_id.to_string(), cert.clone());
                Some(cert)
            }
            Err(e) => {
                tracing::warn!("Unreadable pinned certificate for {}: {}", peer_id, e);
                None
            }
        }
    }

    fn pin(&self, peer_id: &str, cert: &CertificateDer<'_>) -> Result<(), TrustError> {
        Self::write_cert_pem(&self.peer_path(peer_id), cert)?;
        self.cache
            .lock()
            .insert(peer_id.to_string(), cert.clone().into_owned());
        tracing::info!("Pinned certificate for {} ({})", peer_id, &fingerprint(cert)[..16]);
        Ok(())
    }

    fn unpin(&self, peer_id: &str) -> Result<(), TrustError> {
        self.cache.lock().remove(peer_id);
        let path = self.peer_path(peer_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_pins_and_unpins() {
        let store = MemoryTrustStore::new("host1");
        let identity = store.host_identity().unwrap();

        assert!(store.trusted_certificate("dev1").is_none());
        store.pin("dev1", &identity.cert).unwrap();
        assert_eq!(
            store.trusted_certificate("dev1").unwrap().as_ref(),
            identity.cert.as_ref()
        );
        store.unpin("dev1").unwrap();
        assert!(store.trusted_certificate("dev1").is_none());
    }

    #[test]
    fn host_identity_is_stable() {
        let store = MemoryTrustStore::new("host1");
        let a = store.host_identity().unwrap();
        let b = store.host_identity().unwrap();
        assert_eq!(a.cert.as_ref(), b.cert.as_ref());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let first = FileTrustStore::new(dir.path(), "host1");
        let identity = first.host_identity().unwrap();
        first.pin("dev1", &identity.cert).unwrap();

        let second = FileTrustStore::new(dir.path(), "host1");
        let reloaded = second.host_identity().unwrap();
        assert_eq!(reloaded.cert.as_ref(), identity.cert.as_ref());
        assert_eq!(
            second.trusted_certificate("dev1").unwrap().as_ref(),
            identity.cert.as_ref()
        );
        assert!(second.trusted_certificate("dev2").is_none());
    }

    #[test]
    fn fingerprints_are_hex_sha256() {
        let store = MemoryTrustStore::new("host1");
        let identity = store.host_identity().unwrap();
        let fp = fingerprint(&identity.cert);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
