use crate::certs::CertificateAuthority;
use crate::error::Error;
use crate::error::Result;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer as _;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand_chacha::ChaCha20Rng;
use rand_core::CryptoRng;
use rand_core::RngCore;
use rand_core::SeedableRng;
use rcgen::CertificateParams;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::ExtendedKeyUsagePurpose;
use rcgen::IsCa;
use rcgen::KeyPair;
use rcgen::KeyUsagePurpose;
use rcgen::PKCS_ECDSA_P256_SHA256;
use rcgen::PKCS_RSA_SHA256;
use rcgen::RemoteKeyPair;
use rcgen::SanType;
use rcgen::SerialNumber;
use rcgen::SignatureAlgorithm;
use rsa::Pkcs1v15Sign;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs1::EncodeRsaPublicKey as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::pkcs8::EncodePrivateKey as _;
use sha1::Sha1;
use sha2::Digest as _;
use sha2::Sha256;
use std::net::IpAddr;
use time::OffsetDateTime;
use time::Time;

/// Organization name stamped into every minted leaf. Deliberately loud about
/// what it is.
const LEAF_ORGANIZATION: &str = "MPS untrusted MITM proxy Inc";

/// A minted host certificate: DER chain `[leaf, ca]` plus the leaf's PKCS#8
/// private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedCertificate {
    pub chain_der: Vec<Vec<u8>>,
    pub key_der: Vec<u8>,
}

impl SignedCertificate {
    pub fn leaf_der(&self) -> &[u8] {
        self.chain_der.first().map(Vec::as_slice).unwrap_or_default()
    }
}

/// The CA private key, restricted to the two algorithms leaves can mirror.
#[derive(Debug)]
pub(crate) enum CaKey {
    Rsa(RsaPrivateKey),
    Ecdsa(p256::SecretKey),
}

impl CaKey {
    pub(crate) fn from_pem(key_pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(key_pem) {
            return Ok(CaKey::Rsa(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(key_pem) {
            return Ok(CaKey::Rsa(key));
        }
        if let Ok(key) = p256::SecretKey::from_pkcs8_pem(key_pem) {
            return Ok(CaKey::Ecdsa(key));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_pem(key_pem) {
            return Ok(CaKey::Ecdsa(key));
        }
        Err(Error::UnsupportedKeyType)
    }

    /// Canonical PKCS#8 encoding, independent of how the key arrived. Feeds
    /// the deterministic RNG seed.
    pub(crate) fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let der = match self {
            CaKey::Rsa(key) => key.to_pkcs8_der().map_err(cert_sign)?,
            CaKey::Ecdsa(key) => key.to_pkcs8_der().map_err(cert_sign)?,
        };
        Ok(der.as_bytes().to_vec())
    }
}

pub(crate) fn cert_sign(err: impl std::fmt::Display) -> Error {
    Error::CertSign(err.to_string())
}

/// CSPRNG keyed by the CA private key and the host set.
///
/// Identical (CA, hosts) inputs replay the identical stream, so every
/// quantity drawn from it (the leaf key, the serial) is reproducible. That
/// is what keeps concurrent duplicate mints benign and cached TLS sessions
/// valid across re-mints.
struct CertRand(ChaCha20Rng);

impl CertRand {
    fn for_hosts(ca_key_der: &[u8], hosts: &[String]) -> Self {
        let mut sorted: Vec<&str> = hosts.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let host_digest = Sha1::digest(sorted.join(",").as_bytes());

        let mut seed = Sha256::new();
        seed.update(ca_key_der);
        seed.update(host_digest);
        Self(ChaCha20Rng::from_seed(seed.finalize().into()))
    }
}

impl RngCore for CertRand {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand_core::Error> {
        self.0.try_fill_bytes(dest)
    }
}

impl CryptoRng for CertRand {}

/// Signs a leaf certificate for `hosts` under the CA.
///
/// The leaf key matches the CA algorithm (RSA CA → RSA-2048 leaf, P-256 CA →
/// P-256 leaf); its bits, and the serial, come from the deterministic stream.
/// Signatures are deterministic too (PKCS#1 v1.5, or RFC 6979 ECDSA), so two
/// calls with the same CA and host set produce byte-identical DER.
pub fn sign_host(ca: &CertificateAuthority, hosts: &[String]) -> Result<SignedCertificate> {
    let mut rng = CertRand::for_hosts(ca.key_der(), hosts);

    let (leaf_signer, leaf_key_der) = match ca.key() {
        CaKey::Rsa(_) => {
            let key = RsaPrivateKey::new(&mut rng, 2048).map_err(cert_sign)?;
            let der = key.to_pkcs8_der().map_err(cert_sign)?.as_bytes().to_vec();
            (DetSigner::rsa(key)?, der)
        }
        CaKey::Ecdsa(_) => {
            let secret = p256::SecretKey::random(&mut rng);
            let der = secret.to_pkcs8_der().map_err(cert_sign)?.as_bytes().to_vec();
            (DetSigner::ecdsa(SigningKey::from(&secret)), der)
        }
    };
    let serial = rng.next_u64() >> 1;

    let mut dns_hosts = Vec::new();
    let mut ip_hosts = Vec::new();
    for host in hosts {
        match host.parse::<IpAddr>() {
            Ok(ip) => ip_hosts.push(ip),
            Err(_) => dns_hosts.push(host.clone()),
        }
    }

    let mut params = CertificateParams::new(dns_hosts.clone()).map_err(cert_sign)?;
    for ip in ip_hosts {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }
    params.serial_number = Some(SerialNumber::from(serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    if let Some(common_name) = dns_hosts.last() {
        dn.push(DnType::CommonName, common_name.as_str());
    }
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;
    let (not_before, not_after) = leaf_validity();
    params.not_before = not_before;
    params.not_after = not_after;

    let ca_keypair = KeyPair::from_remote(Box::new(DetSigner::for_ca(ca)?)).map_err(cert_sign)?;
    let issuer = CertificateParams::from_ca_cert_pem(ca.cert_pem())
        .map_err(cert_sign)?
        .self_signed(&ca_keypair)
        .map_err(cert_sign)?;
    let leaf_keypair = KeyPair::from_remote(Box::new(leaf_signer)).map_err(cert_sign)?;
    let cert = params
        .signed_by(&leaf_keypair, &issuer, &ca_keypair)
        .map_err(cert_sign)?;

    Ok(SignedCertificate {
        chain_der: vec![cert.der().as_ref().to_vec(), ca.cert_der().to_vec()],
        key_der: leaf_key_der,
    })
}

/// Leaf validity window. `not_after` is truncated to the UTC day so repeated
/// mints within a day stay byte-identical while the window still tracks the
/// clock.
fn leaf_validity() -> (OffsetDateTime, OffsetDateTime) {
    let not_before = OffsetDateTime::UNIX_EPOCH;
    let today = OffsetDateTime::now_utc().replace_time(Time::MIDNIGHT);
    (not_before, today + time::Duration::days(20 * 365))
}

/// rcgen signing backend with deterministic signatures: PKCS#1 v1.5 for RSA,
/// RFC 6979 for P-256. Never touches a system RNG.
struct DetSigner {
    public_key: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
    key: SignerKey,
}

enum SignerKey {
    Rsa(RsaPrivateKey),
    Ecdsa(SigningKey),
}

impl DetSigner {
    fn rsa(key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&key)
            .to_pkcs1_der()
            .map_err(cert_sign)?
            .into_vec();
        Ok(DetSigner {
            public_key,
            algorithm: &PKCS_RSA_SHA256,
            key: SignerKey::Rsa(key),
        })
    }

    fn ecdsa(key: SigningKey) -> Self {
        let public_key = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        DetSigner {
            public_key,
            algorithm: &PKCS_ECDSA_P256_SHA256,
            key: SignerKey::Ecdsa(key),
        }
    }

    fn for_ca(ca: &CertificateAuthority) -> Result<Self> {
        match ca.key() {
            CaKey::Rsa(key) => DetSigner::rsa(key.clone()),
            CaKey::Ecdsa(key) => Ok(DetSigner::ecdsa(SigningKey::from(key))),
        }
    }
}

impl RemoteKeyPair for DetSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        match &self.key {
            SignerKey::Rsa(key) => {
                let digest = Sha256::digest(msg);
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|_| rcgen::Error::RemoteKeyError)
            }
            SignerKey::Ecdsa(key) => {
                let signature: p256::ecdsa::Signature = key.sign(msg);
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}
