use crate::body::Request;
use crate::body::Response;
use crate::context::Context;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter_group::RequestFilterGroup;
use crate::filter_group::ResponseFilterGroup;
use crate::middleware::Middleware;
use http::header::CONTENT_LENGTH;
use http_body::Body as _;
use std::sync::Arc;

/// Plain HTTP forward proxying: absolute-form requests are re-issued to
/// their origin through the middleware chain.
pub struct ForwardHandler {
    ctx: Context,
}

impl Default for ForwardHandler {
    fn default() -> Self {
        ForwardHandler::new()
    }
}

impl ForwardHandler {
    pub fn new() -> Self {
        ForwardHandler::with_context(Context::new())
    }

    pub fn with_context(ctx: Context) -> Self {
        ForwardHandler { ctx }
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

    /// One proxied exchange. Chain errors bubble to the dispatcher, which
    /// renders them as 502.
    pub async fn handle(&self, req: Request) -> Result<Response> {
        let mut ctx = self.ctx.fork();
        let resp = ctx.next(req).await?;
        Ok(reconcile_content_length(resp))
    }
}

/// Drops `Content-Length` when it no longer describes the body that will
/// actually be written (a middleware swapped the body, say). The server
/// framework recomputes framing from the body itself.
pub(crate) fn reconcile_content_length(mut resp: Response) -> Response {
    let declared = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(declared) = declared
        && resp.body().size_hint().exact() != Some(declared)
    {
        resp.headers_mut().remove(CONTENT_LENGTH);
    }
    resp
}
