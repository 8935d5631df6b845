use crate::body::Body;
use crate::body::Request;
use crate::body::Response;
use crate::body::boxed;
use crate::error::Error;
use crate::error::Result;
use http::Uri;
use hyper_rustls::HttpsConnector;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::crypto::ring;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Chooses an upstream proxy for a request, or `None` for a direct
/// connection. Consulted by the tunnel and websocket handlers when resolving
/// their dial target.
pub type ProxySelector = Arc<dyn Fn(&http::request::Parts) -> Option<Uri> + Send + Sync>;

/// Replaces the library's own TCP dialing (tunnel and websocket handlers).
pub type DialOverride =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>> + Send + Sync>;

/// Shared outbound HTTP transport: one pooled client reused by every
/// handler's terminal step, plus the proxy/dial hooks.
///
/// By default upstream TLS certificates are **not** verified: this is a
/// debugging proxy and the origin may well be another interception layer.
/// Use [`Transport::with_upstream_verification`] when that is not acceptable.
pub struct Transport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    pub proxy: Option<ProxySelector>,
    pub dial: Option<DialOverride>,
    /// Timeout for raw TCP dials performed by the tunnel/websocket handlers.
    pub dial_timeout: Duration,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

impl Transport {
    /// Transport that accepts any upstream certificate (the default).
    pub fn new() -> Self {
        Transport::from_tls_config(insecure_tls_config())
    }

    /// Transport that validates upstream certificates against the platform
    /// trust store.
    pub fn with_upstream_verification() -> Result<Self> {
        ensure_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for cert in loaded.certs {
            // Individual unparsable platform certs are skipped, same as the
            // platform's own TLS stacks do.
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(Error::transport("no usable platform root certificates"));
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Transport::from_tls_config(config))
    }

    /// Transport over a caller-supplied TLS client configuration.
    pub fn from_tls_config(tls: ClientConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(15)));
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        Transport {
            client: Client::builder(TokioExecutor::new()).build(https),
            proxy: None,
            dial: None,
            dial_timeout: Duration::from_secs(30),
        }
    }

    /// One HTTP round trip to the request's origin. Cancellation is a fatal
    /// hop error.
    pub async fn round_trip(&self, req: Request, cancel: &CancellationToken) -> Result<Response> {
        tokio::select! {
            // Cancellation wins races against an in-flight exchange.
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = self.client.request(req) => match result {
                Ok(resp) => Ok(resp.map(boxed)),
                Err(err) => Err(Error::transport(err)),
            },
        }
    }

    pub fn proxy_for(&self, parts: &http::request::Parts) -> Option<Uri> {
        self.proxy.as_ref().and_then(|select| select(parts))
    }

    /// Raw TCP dial honoring the dial override, bounded by
    /// [`Transport::dial_timeout`].
    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let target = addr.to_string();
        let fut: Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>> =
            match &self.dial {
                Some(dial) => dial(target),
                None => Box::pin(async move { TcpStream::connect(target).await }),
            };
        match tokio::time::timeout(self.dial_timeout, fut).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(Error::Io(err)),
            Err(_) => Err(Error::transport(format!("dial {addr}: timed out"))),
        }
    }
}

/// Ensures a process-wide rustls crypto provider is installed.
///
/// rustls cannot auto-select a provider when both `ring` and `aws-lc-rs`
/// features are enabled in the dependency graph.
pub(crate) fn ensure_crypto_provider() {
    static RUSTLS_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = ring::default_provider().install_default();
    });
}

fn insecure_tls_config() -> ClientConfig {
    ensure_crypto_provider();
    let verifier = InsecureServerVerifier(ring::default_provider().signature_verification_algorithms);
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

/// Accepts every server certificate. Signatures are still reported as valid
/// without inspection; this verifier exists so the MITM and forward paths can
/// talk to origins (or further proxies) presenting untrusted chains.
#[derive(Debug)]
struct InsecureServerVerifier(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}
