use crate::body::Request;
use crate::body::Response;
use crate::context::Context;
use crate::error::Result;
use crate::filter::Filter;
use crate::middleware::Middleware;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a request-group handler decided to do with the request.
pub enum RequestAction {
    /// Keep going: the (possibly replaced) request continues down the chain.
    Forward(Request),
    /// Short-circuit: this response goes back, nothing downstream runs.
    Respond(Response),
}

#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: Request, ctx: &mut Context) -> RequestAction;
}

pub type BoxRequestActionFuture<'a> = Pin<Box<dyn Future<Output = RequestAction> + Send + 'a>>;

pub struct FnRequestHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> RequestHandler for FnRequestHandler<F>
where
    F: for<'a> Fn(Request, &'a mut Context) -> BoxRequestActionFuture<'a> + Send + Sync,
{
    async fn handle(&self, req: Request, ctx: &mut Context) -> RequestAction {
        (self.0)(req, ctx).await
    }
}

/// Observes (and may replace) whatever the downstream chain produced,
/// response or error.
#[async_trait::async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, result: Result<Response>, ctx: &mut Context) -> Result<Response>;
}

pub type BoxResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

pub struct FnResponseHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> ResponseHandler for FnResponseHandler<F>
where
    F: for<'a> Fn(Result<Response>, &'a mut Context) -> BoxResponseFuture<'a> + Send + Sync,
{
    async fn handle(&self, result: Result<Response>, ctx: &mut Context) -> Result<Response> {
        (self.0)(result, ctx).await
    }
}

/// Builder returned by [`Context::on_request`]. Calling [`run`] registers a
/// synthetic middleware that evaluates the filters against each request and
/// invokes the handler only when every filter matches.
///
/// [`run`]: RequestFilterGroup::run
pub struct RequestFilterGroup<'a> {
    ctx: &'a mut Context,
    filters: Vec<Arc<dyn Filter>>,
}

impl<'a> RequestFilterGroup<'a> {
    pub(crate) fn new(ctx: &'a mut Context, filters: Vec<Arc<dyn Filter>>) -> Self {
        RequestFilterGroup { ctx, filters }
    }

    pub fn run(self, handler: impl RequestHandler + 'static) {
        self.ctx.use_middleware(RequestGroupMiddleware {
            filters: self.filters,
            handler: Arc::new(handler),
        });
    }

    pub fn run_fn<F>(self, f: F)
    where
        F: for<'b> Fn(Request, &'b mut Context) -> BoxRequestActionFuture<'b>
            + Send
            + Sync
            + 'static,
    {
        self.run(FnRequestHandler(f));
    }
}

struct RequestGroupMiddleware {
    filters: Vec<Arc<dyn Filter>>,
    handler: Arc<dyn RequestHandler>,
}

#[async_trait::async_trait]
impl Middleware for RequestGroupMiddleware {
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
        if !self.filters.iter().all(|filter| filter.matches(&req)) {
            return ctx.next(req).await;
        }
        match self.handler.handle(req, ctx).await {
            RequestAction::Respond(resp) => Ok(resp),
            RequestAction::Forward(req) => ctx.next(req).await,
        }
    }
}

/// Builder returned by [`Context::on_response`]; the handler runs after the
/// downstream chain and receives its result.
pub struct ResponseFilterGroup<'a> {
    ctx: &'a mut Context,
    filters: Vec<Arc<dyn Filter>>,
}

impl<'a> ResponseFilterGroup<'a> {
    pub(crate) fn new(ctx: &'a mut Context, filters: Vec<Arc<dyn Filter>>) -> Self {
        ResponseFilterGroup { ctx, filters }
    }

    pub fn run(self, handler: impl ResponseHandler + 'static) {
        self.ctx.use_middleware(ResponseGroupMiddleware {
            filters: self.filters,
            handler: Arc::new(handler),
        });
    }

    pub fn run_fn<F>(self, f: F)
    where
        F: for<'b> Fn(Result<Response>, &'b mut Context) -> BoxResponseFuture<'b>
            + Send
            + Sync
            + 'static,
    {
        self.run(FnResponseHandler(f));
    }
}

struct ResponseGroupMiddleware {
    filters: Vec<Arc<dyn Filter>>,
    handler: Arc<dyn ResponseHandler>,
}

#[async_trait::async_trait]
impl Middleware for ResponseGroupMiddleware {
    async fn handle(&self, req: Request, ctx: &mut Context) -> Result<Response> {
        if !self.filters.iter().all(|filter| filter.matches(&req)) {
            return ctx.next(req).await;
        }
        let result = ctx.next(req).await;
        self.handler.handle(result, ctx).await
    }
}
