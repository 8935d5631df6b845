use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Empty;
use http_body_util::Full;
use http_body_util::combinators::UnsyncBoxBody;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Body type flowing through the middleware chain. Upstream bodies, buffered
/// replacements and synthesized error bodies are all erased into this.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|err| match err {}).boxed_unsync()
}

pub fn empty() -> Body {
    Empty::new().map_err(|err| match err {}).boxed_unsync()
}

/// Erase any compatible body (typically `hyper::body::Incoming`).
pub fn boxed<B>(body: B) -> Body
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}
