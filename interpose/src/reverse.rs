use crate::body::Request;
use crate::body::Response;
use crate::context::Context;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter_group::RequestFilterGroup;
use crate::filter_group::ResponseFilterGroup;
use crate::forward::reconcile_content_length;
use crate::middleware::Middleware;
use std::sync::Arc;

/// Origin proxy: serves origin-form (path-only) requests. It performs no
/// rewriting itself; install a rewrite middleware (for instance
/// [`SingleHostReverseProxy`]) to aim requests at a target scheme and host.
///
/// [`SingleHostReverseProxy`]: crate::middleware::SingleHostReverseProxy
pub struct ReverseHandler {
    ctx: Context,
}

impl Default for ReverseHandler {
    fn default() -> Self {
        ReverseHandler::new()
    }
}

impl ReverseHandler {
    pub fn new() -> Self {
        ReverseHandler::with_context(Context::new())
    }

    pub fn with_context(ctx: Context) -> Self {
        ReverseHandler { ctx }
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

    pub async fn handle(&self, req: Request) -> Result<Response> {
        let mut ctx = self.ctx.fork();
        let resp = ctx.next(req).await?;
        Ok(reconcile_content_length(resp))
    }
}
