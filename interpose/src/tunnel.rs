use crate::body::Request;
use crate::body::Response;
use crate::buffer::BufferPool;
use crate::buffer::default_buffer_pool;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::http_proxy::connection_established;
use crate::middleware::Middleware;
use crate::pool::ConnectionPool;
use crate::transport::Transport;
use crate::wire::copy_with_pool;
use crate::wire::read_response_head;
use crate::wire::write_request_head;
use bytes::Bytes;
use http::header::HOST;
use http::request::Parts;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinError;
use tracing::debug;
use tracing::warn;

/// Opaque CONNECT tunneling, with an optional upstream-proxy cascade and an
/// idle-connection pool for the upstream side.
pub struct TunnelHandler {
    ctx: Context,
    pool: Arc<ConnectionPool>,
    buffers: Arc<dyn BufferPool>,
}

impl Default for TunnelHandler {
    fn default() -> Self {
        TunnelHandler::new()
    }
}

impl TunnelHandler {
    pub fn new() -> Self {
        TunnelHandler::with_context(Context::new())
    }

    pub fn with_context(ctx: Context) -> Self {
        TunnelHandler {
            ctx,
            pool: Arc::new(ConnectionPool::default()),
            buffers: default_buffer_pool(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_buffer_pool(mut self, buffers: Arc<dyn BufferPool>) -> Self {
        self.buffers = buffers;
        self
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

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Serves one CONNECT request.
    ///
    /// The middleware chain runs first and may short-circuit (its response
    /// goes back to the client) or fail (rendered as 502 by the dispatcher).
    /// The expected terminal outcome is the CONNECT sentinel, which hands
    /// back the request head, including any middleware mutations; from there the
    /// handler resolves the upstream, establishes or reuses a connection and
    /// splices raw bytes until either side quits.
    pub async fn handle(&self, mut req: Request) -> Result<Response> {
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();

        let mut ctx = self.ctx.fork();
        let parts = match ctx.next(req).await {
            Ok(resp) => return Ok(resp),
            Err(Error::MethodNotSupported(parts)) => *parts,
            Err(err) => return Err(err),
        };
        let Some(on_upgrade) = on_upgrade else {
            return Err(Error::HijackUnavailable);
        };

        let transport = ctx.transport();
        let (target, is_cascade) = resolve_target(&parts, transport)?;

        let mut upstream = match self.pool.get(&target) {
            Ok(stream) => {
                debug!(upstream = %target, "reusing pooled connection");
                stream
            }
            Err(_) => transport.dial(&target).await?,
        };

        // In a cascade the original CONNECT is replayed so the upstream proxy
        // performs its own tunnel establishment; its reply is consumed here
        // and mirrored, because our own acceptance line is already committed
        // through the server framework.
        let mut leftover = Bytes::new();
        if is_cascade {
            write_request_head(&mut upstream, &parts).await?;
            let (head, rest) = read_response_head(&mut upstream).await?;
            if !(200..300).contains(&head.status) {
                return Err(Error::transport(format!(
                    "upstream proxy refused CONNECT: {}",
                    head.status
                )));
            }
            leftover = rest;
        }

        let pool = Arc::clone(&self.pool);
        let buffers = Arc::clone(&self.buffers);
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!(error = %err, "CONNECT hijack failed");
                    return;
                }
            };
            let client = TokioIo::new(upgraded);
            if let Err(err) = splice_tunnel(client, upstream, leftover, pool, buffers).await {
                debug!(error = %err, upstream = %target, "tunnel closed");
            }
        });

        Ok(connection_established())
    }
}

/// Upstream address for a CONNECT: the transport's proxy hook wins (cascade),
/// otherwise the request target; `:80` is appended when no port is present.
fn resolve_target(parts: &Parts, transport: &Transport) -> Result<(String, bool)> {
    if let Some(proxy) = transport.proxy_for(parts) {
        let authority = proxy
            .authority()
            .ok_or_else(|| Error::InvalidTarget(proxy.to_string()))?;
        return Ok((ensure_port(authority.as_str()), true));
    }

    let target = parts
        .uri
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| Error::InvalidTarget(parts.uri.to_string()))?;
    Ok((ensure_port(&target), false))
}

pub(crate) fn ensure_port(addr: &str) -> String {
    let has_port = match addr.rfind(':') {
        Some(ix) => {
            let suffix = &addr[ix + 1..];
            !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:80")
    }
}

enum TunnelOutcome {
    /// The client side finished first; the upstream write half comes back so
    /// the connection can be pooled.
    ClientDone(std::result::Result<std::io::Result<OwnedWriteHalf>, JoinError>),
    /// The upstream side finished (EOF or client write failure); the
    /// connection is spent.
    UpstreamDone,
}

/// The two splice directions. The client→upstream direction runs as a
/// sibling task; the current task carries upstream→client. Whichever side
/// finishes first decides the upstream connection's fate: a graceful client
/// close leaves it healthy, so it is reunited and offered to the pool; an
/// upstream EOF means it is done for.
async fn splice_tunnel<C>(
    client: C,
    upstream: TcpStream,
    leftover: Bytes,
    pool: Arc<ConnectionPool>,
    buffers: Arc<dyn BufferPool>,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    if !leftover.is_empty() {
        client_wr.write_all(&leftover).await?;
    }
    let (mut upstream_rd, upstream_wr) = upstream.into_split();

    let mut upload = tokio::spawn({
        let buffers = Arc::clone(&buffers);
        async move {
            let mut upstream_wr = upstream_wr;
            copy_with_pool(&mut client_rd, &mut upstream_wr, buffers.as_ref())
                .await
                .map(|_| upstream_wr)
        }
    });

    let outcome = {
        let download = copy_with_pool(&mut upstream_rd, &mut client_wr, buffers.as_ref());
        tokio::pin!(download);
        tokio::select! {
            joined = &mut upload => TunnelOutcome::ClientDone(joined),
            _ = &mut download => TunnelOutcome::UpstreamDone,
        }
    };

    match outcome {
        TunnelOutcome::ClientDone(Ok(Ok(upstream_wr))) => {
            if let Ok(stream) = upstream_rd.reunite(upstream_wr) {
                // On a closed or full pool the drop closes the connection.
                let _ = pool.put(stream);
            }
        }
        TunnelOutcome::ClientDone(_) => {}
        TunnelOutcome::UpstreamDone => {
            upload.abort();
        }
    }
    let _ = client_wr.shutdown().await;
    Ok(())
}
