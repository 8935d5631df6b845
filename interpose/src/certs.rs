use crate::error::Error;
use crate::error::Result;
use crate::mint::CaKey;
use crate::mint::SignedCertificate;
use crate::mint::cert_sign;
use crate::mint::sign_host;
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::PrivatePkcs8KeyDer;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::debug;

/// The user-supplied root certificate and private key, loaded once per MITM
/// handler. The key must be RSA or P-256 ECDSA; leaves mirror the algorithm.
pub struct CertificateAuthority {
    cert_pem: String,
    cert_der: Vec<u8>,
    key: CaKey,
    key_der: Vec<u8>,
}

impl CertificateAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut reader = cert_pem.as_bytes();
        let cert_der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| Error::CertSign("no certificate in CA PEM".to_string()))?
            .map_err(cert_sign)?
            .as_ref()
            .to_vec();
        let key = CaKey::from_pem(key_pem)?;
        let key_der = key.to_pkcs8_der()?;
        Ok(CertificateAuthority {
            cert_pem: cert_pem.to_string(),
            cert_der,
            key,
            key_der,
        })
    }

    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        CertificateAuthority::from_pem(&cert_pem, &key_pem)
    }

    /// PEM of the root certificate, for installing into client trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub(crate) fn key(&self) -> &CaKey {
        &self.key
    }

    pub(crate) fn key_der(&self) -> &[u8] {
        &self.key_der
    }
}

/// A minted certificate plus the rustls server config wrapping it.
pub struct HostCertificate {
    pub signed: SignedCertificate,
    pub server_config: Arc<ServerConfig>,
}

/// Host → certificate cache. Entries are immutable once inserted; reads
/// dominate, so a read/write lock suffices.
pub struct CertificateStore {
    inner: RwLock<HashMap<String, Arc<HostCertificate>>>,
}

impl Default for CertificateStore {
    fn default() -> Self {
        CertificateStore::new()
    }
}

impl CertificateStore {
    pub fn new() -> Self {
        CertificateStore {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<HostCertificate>> {
        let inner = self.inner.read().ok()?;
        inner.get(host.trim()).map(Arc::clone)
    }

    pub fn insert(&self, host: &str, certificate: Arc<HostCertificate>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(host.trim().to_string(), certificate);
        }
    }
}

/// TLS server config for terminating a MITM session toward `host` (port
/// accepted and ignored). Store hit wins; a miss mints under the CA and
/// caches.
///
/// Concurrent misses for the same host may both mint; minting is
/// deterministic in (CA, host), so the duplicates are byte-identical and
/// last-writer-wins is benign.
pub fn server_config_for(
    ca: &CertificateAuthority,
    store: &CertificateStore,
    host: &str,
) -> Result<Arc<ServerConfig>> {
    let host = strip_port(host);
    if let Some(entry) = store.get(host) {
        return Ok(Arc::clone(&entry.server_config));
    }

    let signed = sign_host(ca, &[host.to_string()])?;
    let server_config = tls_server_config(&signed)?;
    debug!(host, "minted leaf certificate");
    store.insert(
        host,
        Arc::new(HostCertificate {
            signed,
            server_config: Arc::clone(&server_config),
        }),
    );
    Ok(server_config)
}

fn tls_server_config(signed: &SignedCertificate) -> Result<Arc<ServerConfig>> {
    crate::transport::ensure_crypto_provider();
    let chain: Vec<CertificateDer<'static>> = signed
        .chain_der
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signed.key_der.clone()));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(cert_sign)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// `host:port` → `host`, including the IPv6 bracket form. A bare IPv6
/// address (more than one colon, no brackets) is returned untouched.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.find(':') {
        Some(ix) if host[ix + 1..].contains(':') => host,
        Some(ix) => &host[..ix],
        None => host,
    }
}
