//! An embeddable intercepting HTTP/HTTPS proxy.
//!
//! Four request-handling modes share one dispatch fabric: plain forward
//! proxying, reverse (origin) proxying, opaque CONNECT tunneling with an
//! upstream-proxy cascade, and MITM TLS interception with per-host
//! certificates minted under a local CA. A websocket pass-through rides
//! alongside. An ordered middleware chain plus request/response filter
//! groups let embedders observe, rewrite or refuse every hop.
//!
//! # Security
//!
//! By default the outbound transport does **not** verify upstream TLS
//! certificates: this is a debugging proxy, and interception only works if
//! the far side may itself be untrusted. Build the shared transport with
//! [`Transport::with_upstream_verification`] when proxying traffic whose
//! upstream identity matters.
//!
//! # Example
//!
//! ```no_run
//! use interpose::HttpProxy;
//! use std::sync::Arc;
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! let proxy = Arc::new(HttpProxy::new());
//! proxy.serve(listener).await
//! # }
//! ```

mod body;
mod buffer;
mod certs;
mod context;
mod error;
mod filter;
mod filter_group;
mod forward;
mod http_proxy;
pub mod middleware;
mod mint;
mod mitm;
mod pool;
mod reverse;
mod transport;
mod tunnel;
mod websocket;
mod wire;

pub use body::Body;
pub use body::BoxError;
pub use body::Request;
pub use body::Response;
pub use body::boxed;
pub use body::empty;
pub use body::full;
pub use buffer::BufferPool;
pub use buffer::FixedBufferPool;
pub use buffer::default_buffer_pool;
pub use certs::CertificateAuthority;
pub use certs::CertificateStore;
pub use certs::HostCertificate;
pub use certs::server_config_for;
pub use context::Context;
pub use error::Error;
pub use error::Result;
pub use filter::Filter;
pub use filter::FilterFn;
pub use filter::HostFilter;
pub use filter::MethodFilter;
pub use filter::PathFilter;
pub use filter_group::FnRequestHandler;
pub use filter_group::FnResponseHandler;
pub use filter_group::RequestAction;
pub use filter_group::RequestFilterGroup;
pub use filter_group::RequestHandler;
pub use filter_group::ResponseFilterGroup;
pub use filter_group::ResponseHandler;
pub use forward::ForwardHandler;
pub use http_proxy::ClientAddr;
pub use http_proxy::ConnectHandler;
pub use http_proxy::HttpProxy;
pub use middleware::FnMiddleware;
pub use middleware::Middleware;
pub use mint::SignedCertificate;
pub use mint::sign_host;
pub use mitm::MitmHandler;
pub use pool::ConnectionPool;
pub use pool::PoolError;
pub use pool::PoolOptions;
pub use reverse::ReverseHandler;
pub use transport::DialOverride;
pub use transport::ProxySelector;
pub use transport::Transport;
pub use tunnel::TunnelHandler;
pub use websocket::WebsocketHandler;
pub use websocket::is_upgrade_request;
