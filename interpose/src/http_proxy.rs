use crate::body::Request;
use crate::body::Response;
use crate::body::boxed;
use crate::body::empty;
use crate::body::full;
use crate::certs::CertificateAuthority;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::forward::ForwardHandler;
use crate::middleware::Middleware;
use crate::mitm::MitmHandler;
use crate::reverse::ReverseHandler;
use crate::tunnel::TunnelHandler;
use crate::websocket::WebsocketHandler;
use crate::websocket::is_upgrade_request;
use http::Method;
use http::StatusCode;
use http::Version;
use http::header::CONTENT_TYPE;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::warn;

/// Address of the downstream client, carried as a request extension so
/// middlewares (and the MITM inner loop) can observe the true peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// How CONNECT requests are served: as an opaque tunnel, or intercepted.
pub enum ConnectHandler {
    Tunnel(TunnelHandler),
    Mitm(MitmHandler),
}

/// Top-level dispatcher. Routes each request by method and URL form:
/// CONNECT to the tunnel or MITM handler, websocket upgrades (when enabled)
/// to the pass-through, absolute-form URIs to the forward handler and
/// origin-form URIs to the reverse handler.
pub struct HttpProxy {
    pub connect: ConnectHandler,
    pub forward: ForwardHandler,
    pub reverse: ReverseHandler,
    pub websocket: Option<WebsocketHandler>,
}

impl Default for HttpProxy {
    fn default() -> Self {
        HttpProxy::new()
    }
}

impl HttpProxy {
    /// Proxy with opaque CONNECT tunneling.
    pub fn new() -> Self {
        let template = Context::new();
        HttpProxy {
            connect: ConnectHandler::Tunnel(TunnelHandler::with_context(template.clone())),
            forward: ForwardHandler::with_context(template.clone()),
            reverse: ReverseHandler::with_context(template),
            websocket: None,
        }
    }

    /// Proxy that intercepts CONNECT tunnels with certificates minted under
    /// `ca`.
    pub fn with_mitm(ca: CertificateAuthority) -> Self {
        let template = Context::new();
        HttpProxy {
            connect: ConnectHandler::Mitm(MitmHandler::with_context(ca, template.clone())),
            forward: ForwardHandler::with_context(template.clone()),
            reverse: ReverseHandler::with_context(template),
            websocket: None,
        }
    }

    /// Enables the websocket pass-through path.
    pub fn with_websocket(mut self) -> Self {
        self.websocket = Some(WebsocketHandler::new());
        self
    }

    /// Registers a middleware on every handler, preserving registration
    /// order across the proxy.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.use_middleware_arc(Arc::new(middleware));
    }

    pub fn use_middleware_arc(&mut self, middleware: Arc<dyn Middleware>) {
        match &mut self.connect {
            ConnectHandler::Tunnel(handler) => {
                handler.context_mut().use_middleware_arc(Arc::clone(&middleware));
            }
            ConnectHandler::Mitm(handler) => {
                handler.context_mut().use_middleware_arc(Arc::clone(&middleware));
            }
        }
        self.forward
            .context_mut()
            .use_middleware_arc(Arc::clone(&middleware));
        self.reverse.context_mut().use_middleware_arc(middleware);
    }

    /// Serves one request; hop errors become a 502 to the downstream client.
    pub async fn handle(&self, req: Request) -> Response {
        match self.dispatch(req).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "proxied request failed");
                bad_gateway(&err)
            }
        }
    }

    async fn dispatch(&self, req: Request) -> Result<Response> {
        if req.method() == Method::CONNECT {
            return match &self.connect {
                ConnectHandler::Tunnel(handler) => handler.handle(req).await,
                ConnectHandler::Mitm(handler) => handler.handle(req).await,
            };
        }
        if let Some(websocket) = &self.websocket
            && is_upgrade_request(&req)
        {
            return websocket.handle(req).await;
        }
        if req.uri().scheme().is_some() {
            self.forward.handle(req).await
        } else {
            self.reverse.handle(req).await
        }
    }

    /// Serves one accepted client connection, upgrades enabled. The peer
    /// address is stamped onto each request as [`ClientAddr`].
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let proxy = Arc::clone(&self);
        let service = service_fn(move |mut req: http::Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            async move {
                if let Some(addr) = peer {
                    req.extensions_mut().insert(ClientAddr(addr));
                }
                Ok::<_, Infallible>(proxy.handle(req.map(boxed)).await)
            }
        });

        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(error = %err, "client connection ended");
        }
    }

    /// Accept loop over a bound listener. Each connection is served on its
    /// own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, _peer) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            tokio::spawn(proxy.serve_connection(stream));
        }
    }
}

/// The tunnel acceptance line: `HTTP/1.0 200 Connection Established`.
pub(crate) fn connection_established() -> Response {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::OK;
    *resp.version_mut() = Version::HTTP_10;
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    resp
}

/// Hop-boundary failure rendering: any non-sentinel error becomes a 502.
pub(crate) fn bad_gateway(err: &Error) -> Response {
    let mut resp = Response::new(full(format!("proxy error: {err}")));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
