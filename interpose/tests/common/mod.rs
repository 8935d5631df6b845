#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use interpose::CertificateAuthority;
use interpose::HttpProxy;
use rcgen::CertificateParams;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::IsCa;
use rcgen::KeyPair;
use rcgen::PKCS_ECDSA_P256_SHA256;
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::PrivatePkcs8KeyDer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

pub fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub struct Origin {
    pub addr: SocketAddr,
    /// TCP connections accepted, not requests served.
    pub accepted: Arc<AtomicUsize>,
    /// Request headers in arrival order.
    pub seen_headers: Arc<Mutex<Vec<http::HeaderMap>>>,
}

/// Plain-HTTP origin answering every request with `body` (hyper supplies the
/// matching `Content-Length`).
pub async fn start_origin(body: &'static str) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let seen_headers = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn({
        let accepted = Arc::clone(&accepted);
        let seen_headers = Arc::clone(&seen_headers);
        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let seen_headers = Arc::clone(&seen_headers);
                tokio::spawn(async move {
                    let service = service_fn(move |req: http::Request<Incoming>| {
                        let seen_headers = Arc::clone(&seen_headers);
                        async move {
                            seen_headers
                                .lock()
                                .expect("headers lock")
                                .push(req.headers().clone());
                            Ok::<_, Infallible>(http::Response::new(Full::new(
                                Bytes::from_static(body.as_bytes()),
                            )))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        }
    });

    Origin {
        addr,
        accepted,
        seen_headers,
    }
}

/// TLS origin with a throwaway self-signed certificate for `127.0.0.1` (the
/// proxy's outbound transport does not verify it).
pub async fn start_tls_origin(body: &'static str) -> SocketAddr {
    ensure_crypto_provider();

    let key = KeyPair::generate().expect("origin key");
    let mut params = CertificateParams::new(Vec::new()).expect("origin params");
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().expect("ip")));
    let cert = params.self_signed(&key).expect("origin cert");

    let chain = vec![CertificateDer::from(cert.der().as_ref().to_vec())];
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .expect("origin tls config");
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(move |_req: http::Request<Incoming>| async move {
                    Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from_static(
                        body.as_bytes(),
                    ))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

pub async fn start_proxy(proxy: HttpProxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(Arc::new(proxy).serve(listener));
    addr
}

/// Fresh ECDSA P-256 CA for MITM tests.
pub fn test_ca() -> CertificateAuthority {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("ca key");
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "interpose test CA");
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).expect("ca cert");
    CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).expect("ca bundle")
}

/// Reads until the blank line ending an HTTP head. Returns the head text and
/// any bytes that arrived after it.
pub async fn read_until_blank_line(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
            let leftover = buf[pos + 4..].to_vec();
            return (head, leftover);
        }
        let n = stream.read(&mut chunk).await.expect("read head");
        if n == 0 {
            return (String::from_utf8_lossy(&buf).into_owned(), Vec::new());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads one response: head plus a `Content-Length`-framed body.
pub async fn read_http_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let (head, mut body) = read_until_blank_line(stream).await;
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut chunk = [0u8; 1024];
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.expect("read body");
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

pub fn basic_credentials(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}
