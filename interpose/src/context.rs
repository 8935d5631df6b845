use crate::body::Request;
use crate::body::Response;
use crate::error::Error;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter_group::RequestFilterGroup;
use crate::filter_group::ResponseFilterGroup;
use crate::middleware::BoxMiddlewareFuture;
use crate::middleware::FnMiddleware;
use crate::middleware::Middleware;
use crate::transport::Transport;
use http::Method;
use http::header::ACCEPT_ENCODING;
use http::header::CONNECTION;
use http::header::PROXY_AUTHENTICATE;
use http::header::PROXY_AUTHORIZATION;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ambient state for one request/response lifecycle.
///
/// A *template* context is built once per handler and carries the transport,
/// the header-hygiene flags and the registered middleware list. Handlers call
/// [`Context::fork`] to obtain a per-request *working* context; the chain
/// cursor lives only on the working clone, so one template can serve any
/// number of concurrent requests.
pub struct Context {
    cancel: CancellationToken,
    transport: Arc<Transport>,

    /// Retain `Proxy-Connection` / `Proxy-Authenticate` / `Proxy-Authorization`
    /// on the outbound request. Needed when the upstream is itself a proxy.
    pub keep_proxy_headers: bool,
    /// Retain `Accept-Encoding` when reissuing the request, instead of letting
    /// the transport negotiate compression on its own.
    pub keep_client_headers: bool,
    /// Preserve headers an embedder pre-set on its response writer when
    /// copying upstream response headers back. Only meaningful to embedders
    /// that merge responses into an existing writer.
    pub keep_destination_headers: bool,

    middlewares: Vec<Arc<dyn Middleware>>,
    /// Chain cursor; `None` means "before first". Only ever advanced on a
    /// working clone.
    cursor: Option<usize>,
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Clone for Context {
    /// Clones are working copies: identical configuration, cursor rewound,
    /// cancellation chained to the original.
    fn clone(&self) -> Self {
        self.fork()
    }
}

impl Context {
    /// Context with the default (upstream-insecure) transport and no
    /// middlewares.
    pub fn new() -> Self {
        Context::with_transport(Arc::new(Transport::new()))
    }

    pub fn with_transport(transport: Arc<Transport>) -> Self {
        Context {
            cancel: CancellationToken::new(),
            transport,
            keep_proxy_headers: false,
            keep_client_headers: false,
            keep_destination_headers: false,
            middlewares: Vec::new(),
            cursor: None,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn set_transport(&mut self, transport: Arc<Transport>) {
        self.transport = transport;
    }

    /// Token canceling all in-flight work for this request. Middlewares may
    /// watch it to abandon work early; handlers treat cancellation as a fatal
    /// hop error.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Appends a middleware. Registration order is execution order.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middlewares.push(Arc::new(middleware));
    }

    pub fn use_middleware_arc(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Closure form of [`Context::use_middleware`]; the closure boxes its
    /// future because it re-borrows the context.
    pub fn use_fn<F>(&mut self, f: F)
    where
        F: for<'a> Fn(Request, &'a mut Context) -> BoxMiddlewareFuture<'a> + Send + Sync + 'static,
    {
        self.use_middleware(FnMiddleware(f));
    }

    /// Conditional middleware: the handler runs only for requests every
    /// filter matches; all other requests pass through untouched.
    pub fn on_request(&mut self, filters: Vec<Arc<dyn Filter>>) -> RequestFilterGroup<'_> {
        RequestFilterGroup::new(self, filters)
    }

    /// Conditional response hook: runs after the downstream chain returns,
    /// for requests every filter matches.
    pub fn on_response(&mut self, filters: Vec<Arc<dyn Filter>>) -> ResponseFilterGroup<'_> {
        ResponseFilterGroup::new(self, filters)
    }

    /// Per-request working clone: same transport, flags and middleware list,
    /// fresh cancellation child, cursor rewound to "before first".
    pub fn fork(&self) -> Context {
        Context {
            cancel: self.cancel.child_token(),
            transport: Arc::clone(&self.transport),
            keep_proxy_headers: self.keep_proxy_headers,
            keep_client_headers: self.keep_client_headers,
            keep_destination_headers: self.keep_destination_headers,
            middlewares: self.middlewares.clone(),
            cursor: None,
        }
    }

    /// Advances the chain: invokes the middleware at the next position, or
    /// performs the terminal transport step once past the end.
    ///
    /// The cursor is rewound after any middleware completes, which is what
    /// makes a working context reusable for the next outer-level request but
    /// also why a single working context must never run two requests
    /// concurrently.
    pub async fn next(&mut self, req: Request) -> Result<Response> {
        let index = match self.cursor {
            None => 0,
            Some(current) => current + 1,
        };
        if index >= self.middlewares.len() {
            self.cursor = None;
            return self.terminal(req).await;
        }

        self.cursor = Some(index);
        let middleware = Arc::clone(&self.middlewares[index]);
        let result = middleware.handle(req, self).await;
        self.cursor = None;
        result
    }

    /// Terminal step: header hygiene, then the transport round trip. CONNECT
    /// is refused with the sentinel so tunnel-shaped handlers can take over.
    async fn terminal(&self, req: Request) -> Result<Response> {
        if req.method() == Method::CONNECT {
            let (parts, _body) = req.into_parts();
            return Err(Error::MethodNotSupported(Box::new(parts)));
        }

        let mut req = req;
        scrub_request(
            &mut req,
            self.keep_client_headers,
            self.keep_proxy_headers,
        );
        self.transport.round_trip(req, &self.cancel).await
    }
}

/// Hop-by-hop header hygiene, RFC 7230. Applied at the terminal step unless
/// the context opts out.
fn scrub_request(req: &mut Request, keep_client_headers: bool, keep_proxy_headers: bool) {
    let headers = req.headers_mut();
    if !keep_client_headers {
        // Let the transport negotiate compression it can actually decode.
        headers.remove(ACCEPT_ENCODING);
    }
    if !keep_proxy_headers {
        headers.remove("proxy-connection");
        headers.remove(PROXY_AUTHENTICATE);
        headers.remove(PROXY_AUTHORIZATION);
        // `Connection: close` spoke about the client↔proxy hop; dropping the
        // header is enough, the client library re-derives connection
        // semantics for the next hop.
        headers.remove(CONNECTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty;
    use http::HeaderValue;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        call_next: bool,
    }

    #[async_trait::async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
            self.log.lock().expect("log lock").push(self.id);
            if self.call_next {
                ctx.next(req).await
            } else {
                Ok(Response::new(empty()))
            }
        }
    }

    fn chain(log: &Arc<Mutex<Vec<usize>>>, ids: &[usize], stop_at: Option<usize>) -> Context {
        let mut ctx = Context::new();
        for &id in ids {
            ctx.use_middleware(Recorder {
                id,
                log: Arc::clone(log),
                call_next: stop_at != Some(id),
            });
        }
        ctx
    }

    fn connect_request() -> Request {
        let mut req = Request::new(empty());
        *req.method_mut() = Method::CONNECT;
        *req.uri_mut() = "example.com:443".parse().expect("uri");
        req
    }

    #[tokio::test]
    async fn middlewares_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let template = chain(&log, &[1, 2, 3], None);

        let mut ctx = template.fork();
        let err = ctx.next(connect_request()).await.expect_err("sentinel");
        assert!(err.is_method_not_supported());
        assert_eq!(*log.lock().expect("log lock"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn short_circuit_skips_later_middlewares_and_transport() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let template = chain(&log, &[1, 2, 3], Some(2));

        let mut ctx = template.fork();
        let resp = ctx.next(connect_request()).await.expect("response");
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(*log.lock().expect("log lock"), vec![1, 2]);
    }

    #[tokio::test]
    async fn cursor_rewinds_between_sequential_requests() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let template = chain(&log, &[1, 2], None);

        let mut ctx = template.fork();
        for _ in 0..2 {
            let err = ctx.next(connect_request()).await.expect_err("sentinel");
            assert!(err.is_method_not_supported());
        }
        assert_eq!(*log.lock().expect("log lock"), vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn sentinel_carries_middleware_mutations_back() {
        let mut template = Context::new();
        template.use_fn(|mut req: Request, ctx: &mut Context| {
            Box::pin(async move {
                req.headers_mut()
                    .insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
                ctx.next(req).await
            })
        });

        let mut ctx = template.fork();
        let err = ctx.next(connect_request()).await.expect_err("sentinel");
        let Error::MethodNotSupported(parts) = err else {
            panic!("expected sentinel, got {err:?}");
        };
        assert_eq!(
            parts.headers.get("proxy-authorization"),
            Some(&HeaderValue::from_static("Basic abc"))
        );
    }

    #[tokio::test]
    async fn cancellation_is_a_fatal_hop_error() {
        let template = Context::new();
        let mut ctx = template.fork();
        ctx.cancellation().cancel();

        let mut req = Request::new(empty());
        // Reserved port; the round trip would fail eventually, but the
        // already-fired token must win the race.
        *req.uri_mut() = "http://127.0.0.1:1/".parse().expect("uri");
        let err = ctx.next(req).await.expect_err("canceled");
        assert!(matches!(err, Error::Canceled));
    }

    #[test]
    fn default_hygiene_strips_hop_headers() {
        let mut req = Request::new(empty());
        *req.uri_mut() = "http://origin/".parse().expect("uri");
        for (name, value) in [
            ("accept-encoding", "gzip"),
            ("proxy-connection", "keep-alive"),
            ("proxy-authenticate", "Basic realm=r"),
            ("proxy-authorization", "Basic abc"),
            ("connection", "close"),
            ("x-keep", "1"),
        ] {
            req.headers_mut()
                .insert(name, HeaderValue::from_static(value));
        }

        scrub_request(&mut req, false, false);

        for name in [
            "accept-encoding",
            "proxy-connection",
            "proxy-authenticate",
            "proxy-authorization",
            "connection",
        ] {
            assert!(req.headers().get(name).is_none(), "{name} should be gone");
        }
        assert_eq!(
            req.headers().get("x-keep"),
            Some(&HeaderValue::from_static("1"))
        );
    }

    #[test]
    fn keep_proxy_headers_preserves_proxy_headers_verbatim() {
        let mut req = Request::new(empty());
        for (name, value) in [
            ("proxy-connection", "keep-alive"),
            ("proxy-authenticate", "Basic realm=r"),
            ("proxy-authorization", "Basic abc"),
            ("accept-encoding", "gzip"),
        ] {
            req.headers_mut()
                .insert(name, HeaderValue::from_static(value));
        }

        scrub_request(&mut req, false, true);

        assert_eq!(
            req.headers().get("proxy-connection"),
            Some(&HeaderValue::from_static("keep-alive"))
        );
        assert_eq!(
            req.headers().get("proxy-authenticate"),
            Some(&HeaderValue::from_static("Basic realm=r"))
        );
        assert_eq!(
            req.headers().get("proxy-authorization"),
            Some(&HeaderValue::from_static("Basic abc"))
        );
        // keep_proxy_headers does not imply keep_client_headers.
        assert!(req.headers().get("accept-encoding").is_none());
    }
}
