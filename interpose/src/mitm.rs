use crate::body::Request;
use crate::body::Response;
use crate::body::boxed;
use crate::body::full;
use crate::certs::CertificateAuthority;
use crate::certs::CertificateStore;
use crate::certs::server_config_for;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter_group::RequestFilterGroup;
use crate::filter_group::ResponseFilterGroup;
use crate::http_proxy::ClientAddr;
use crate::http_proxy::bad_gateway;
use crate::http_proxy::connection_established;
use crate::middleware::Middleware;
use http::header::CONTENT_LENGTH;
use http::header::HOST;
use http::header::TRANSFER_ENCODING;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::debug;
use tracing::info;
use tracing::warn;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS interception: answers a CONNECT with a tunnel terminated at the
/// proxy, presenting a leaf certificate minted on demand under the
/// configured CA, then serves the decrypted HTTP/1.x stream through the
/// middleware chain and re-originates each request to the real origin.
///
/// Clients must trust the CA certificate for the interception to be
/// transparent.
pub struct MitmHandler {
    ctx: Context,
    ca: Arc<CertificateAuthority>,
    store: Arc<CertificateStore>,
}

impl MitmHandler {
    pub fn new(ca: CertificateAuthority) -> Self {
        MitmHandler::with_context(ca, Context::new())
    }

    pub fn with_context(ca: CertificateAuthority, ctx: Context) -> Self {
        MitmHandler {
            ctx,
            ca: Arc::new(ca),
            store: Arc::new(CertificateStore::new()),
        }
    }

    /// Substitutes the certificate store (shared across handlers, say).
    pub fn with_store(mut self, store: Arc<CertificateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.ctx.use_middleware(middleware);
    }

    pub fn on_request(&mut self, filters: Vec<Arc<dyn Filter>>) -> RequestFilterGroup<'_> {
        self.ctx.on_request(filters)
    }

    pub fn on_response(&mut self, filters: Vec<Arc<dyn Filter>>) -> ResponseFilterGroup<'_> {
        self.ctx.on_response(filters)
    }

    /// TLS server config for the target host, minting through the store on a
    /// miss. Exposed for embedders that terminate TLS themselves.
    pub fn tls_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        server_config_for(&self.ca, &self.store, host)
    }

    /// Serves one CONNECT request by interception.
    ///
    /// The middleware chain sees the CONNECT first and may short-circuit it;
    /// the expected terminal outcome is the sentinel. Certificate minting
    /// happens before the tunnel is accepted so a failure can still be
    /// refused with a 502. The decrypted session runs on its own task so the
    /// server considers this request complete once the tunnel is up.
    pub async fn handle(&self, mut req: Request) -> Result<Response> {
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let client_addr = req.extensions().get::<ClientAddr>().copied();

        let mut ctx = self.ctx.fork();
        let parts = match ctx.next(req).await {
            Ok(resp) => return Ok(resp),
            Err(Error::MethodNotSupported(parts)) => *parts,
            Err(err) => return Err(err),
        };
        let Some(on_upgrade) = on_upgrade else {
            return Err(Error::HijackUnavailable);
        };

        let authority = parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .ok_or_else(|| Error::InvalidTarget(parts.uri.to_string()))?;

        let server_config = self.tls_config_for(&authority)?;
        info!(host = %authority, "intercepting CONNECT");

        let template = self.ctx.fork();
        tokio::spawn(serve_intercepted(
            on_upgrade,
            server_config,
            template,
            authority,
            client_addr,
        ));

        Ok(connection_established())
    }
}

/// The decrypted side of an intercepted tunnel: accept TLS with the minted
/// certificate, then serve inner HTTP/1.x requests until the client quits.
async fn serve_intercepted(
    on_upgrade: OnUpgrade,
    server_config: Arc<ServerConfig>,
    template: Context,
    authority: String,
    client_addr: Option<ClientAddr>,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            warn!(error = %err, host = %authority, "CONNECT hijack failed");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(server_config);
    let accept = acceptor.accept(TokioIo::new(upgraded));
    let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, accept).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(err)) => {
            warn!(error = %err, host = %authority, "client TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(host = %authority, "client TLS handshake timed out");
            return;
        }
    };

    let authority = Arc::new(authority);
    let service = service_fn(move |req: http::Request<Incoming>| {
        let template = template.clone();
        let authority = Arc::clone(&authority);
        async move {
            Ok::<_, Infallible>(intercepted_request(req, template, &authority, client_addr).await)
        }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        debug!(error = %err, "intercepted session ended");
    }
}

/// One decrypted request: aim it back at the real origin over TLS, run the
/// chain, and re-frame the response for the intercepted stream.
async fn intercepted_request(
    req: http::Request<Incoming>,
    template: Context,
    authority: &str,
    client_addr: Option<ClientAddr>,
) -> Response {
    let (mut parts, body) = req.into_parts();

    if parts.uri.scheme().is_none() {
        let path_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match format!("https://{authority}{path_query}").parse() {
            Ok(uri) => parts.uri = uri,
            Err(err) => {
                warn!(error = %err, host = %authority, "illegal intercepted URL");
                return bad_gateway(&Error::InvalidTarget(authority.to_string()));
            }
        }
    }
    // The connection to the origin is ours, not the client's; keep the
    // original peer address observable for middlewares.
    if let Some(addr) = client_addr {
        parts.extensions.insert(addr);
    }

    let mut ctx = template.fork();
    match ctx.next(http::Request::from_parts(parts, boxed(body))).await {
        Ok(resp) => reframe_response(resp).await,
        Err(err) => {
            warn!(error = %err, host = %authority, "intercepted round trip failed");
            bad_gateway(&err)
        }
    }
}

/// Buffers the body and drops stale framing headers so the length on the
/// intercepted stream is the length actually observed.
async fn reframe_response(resp: Response) -> Response {
    let (mut parts, body) = resp.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            parts.headers.remove(CONTENT_LENGTH);
            parts.headers.remove(TRANSFER_ENCODING);
            Response::from_parts(parts, full(bytes))
        }
        Err(err) => bad_gateway(&Error::Transport(err)),
    }
}
