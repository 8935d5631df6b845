use crate::body::Request;
use crate::body::Response;
use crate::body::full;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderValue;
use http::StatusCode;
use http::Uri;
use http::header::HOST;
use http::header::PROXY_AUTHENTICATE;
use http::header::PROXY_AUTHORIZATION;
use http::header::USER_AGENT;
use std::future::Future;
use std::pin::Pin;

/// One link in the ordered handler chain.
///
/// A middleware may return a response directly (short-circuiting the rest of
/// the chain and the transport), call [`Context::next`] and return its output
/// verbatim, or call `next` and mutate the result before returning it. Errors
/// bubble up unchanged.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response>;
}

pub type BoxMiddlewareFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// Adapter turning a closure into a [`Middleware`].
///
/// The closure must box its future because it re-borrows the context:
///
/// ```ignore
/// ctx.use_fn(|req, ctx| {
///     Box::pin(async move { ctx.next(req).await })
/// });
/// ```
pub struct FnMiddleware<F>(pub F);

#[async_trait::async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(Request, &'a mut Context) -> BoxMiddlewareFuture<'a> + Send + Sync,
{
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
        (self.0)(req, ctx).await
    }
}

/// HTTP Basic proxy authentication.
///
/// Challenges with `407 Proxy Authentication Required` until the downstream
/// client presents credentials the verifier accepts, then passes the request
/// down the chain. Register it first so nothing else runs unauthenticated.
pub struct BasicAuth {
    realm: String,
    verify: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl BasicAuth {
    pub fn new(
        realm: impl Into<String>,
        verify: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        BasicAuth {
            realm: realm.into(),
            verify: Box::new(verify),
        }
    }

    fn challenge(&self) -> Response {
        const MESSAGE: &str = "407 Proxy Authentication Required";
        let mut resp = Response::new(full(MESSAGE));
        *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm={}", self.realm)) {
            resp.headers_mut().insert(PROXY_AUTHENTICATE, value);
        }
        resp.headers_mut()
            .insert("proxy-connection", HeaderValue::from_static("close"));
        resp
    }
}

#[async_trait::async_trait]
impl Middleware for BasicAuth {
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
        let credentials = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_basic_auth);
        match credentials {
            Some((user, password)) if (self.verify)(&user, &password) => ctx.next(req).await,
            _ => Ok(self.challenge()),
        }
    }
}

/// Sets `Proxy-Authorization` the way a cascade client authenticates against
/// its upstream proxy.
pub fn set_proxy_basic_auth(req: &mut Request, username: &str, password: &str) {
    let token = BASE64.encode(format!("{username}:{password}"));
    if let Ok(value) = HeaderValue::from_str(&format!("Basic {token}")) {
        req.headers_mut().insert(PROXY_AUTHORIZATION, value);
    }
}

/// Parses `Basic <base64(user:pass)>`. The scheme match is case-insensitive.
fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    const PREFIX: &str = "Basic ";
    if value.len() < PREFIX.len() || !value[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let decoded = BASE64.decode(&value[PREFIX.len()..]).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Rewrites requests toward a single fixed origin: scheme and host are taken
/// from the target, the target's path is prefixed onto the request path, and
/// query strings are merged. Pair this with the reverse handler, which
/// expects a middleware to aim origin-form requests somewhere.
///
/// The `Host` header is rewritten to the target authority.
pub struct SingleHostReverseProxy {
    target: Uri,
}

impl SingleHostReverseProxy {
    pub fn new(target: Uri) -> Self {
        SingleHostReverseProxy { target }
    }
}

#[async_trait::async_trait]
impl Middleware for SingleHostReverseProxy {
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
        let (mut parts, body) = req.into_parts();

        let path = single_joining_slash(self.target.path(), parts.uri.path());
        let query = match (self.target.query(), parts.uri.query()) {
            (Some(t), Some(r)) => format!("?{t}&{r}"),
            (Some(t), None) => format!("?{t}"),
            (None, Some(r)) => format!("?{r}"),
            (None, None) => String::new(),
        };

        let mut builder = Uri::builder().path_and_query(format!("{path}{query}"));
        if let Some(scheme) = self.target.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.target.authority() {
            builder = builder.authority(authority.clone());
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, host);
            }
        }
        parts.uri = builder
            .build()
            .map_err(|err| Error::InvalidTarget(err.to_string()))?;

        // Disable the client library's default User-Agent rather than
        // advertising one the downstream client never sent.
        parts
            .headers
            .entry(USER_AGENT)
            .or_insert(HeaderValue::from_static(""));

        ctx.next(Request::from_parts(parts, body)).await
    }
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}
