use crate::body::Request;
use crate::body::Response;
use crate::body::empty;
use crate::buffer::BufferPool;
use crate::buffer::default_buffer_pool;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::tunnel::ensure_port;
use crate::wire::read_response_head;
use crate::wire::splice;
use crate::wire::write_request_head;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use http::header::CONNECTION;
use http::header::HOST;
use http::header::UPGRADE;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::warn;

/// WebSocket pass-through: relays the upgrade handshake to the upstream and
/// splices frames byte-for-byte afterwards. No middleware runs on this path.
pub struct WebsocketHandler {
    ctx: Context,
    buffers: Arc<dyn BufferPool>,
}

impl Default for WebsocketHandler {
    fn default() -> Self {
        WebsocketHandler::new()
    }
}

impl WebsocketHandler {
    pub fn new() -> Self {
        WebsocketHandler::with_context(Context::new())
    }

    pub fn with_context(ctx: Context) -> Self {
        WebsocketHandler {
            ctx,
            buffers: default_buffer_pool(),
        }
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

    /// Relays one upgrade handshake. Callers route here only for requests
    /// [`is_upgrade_request`] accepts.
    pub async fn handle(&self, mut req: Request) -> Result<Response> {
        if !is_upgrade_request(&req) {
            return Err(Error::InvalidTarget(
                "not a websocket upgrade request".to_string(),
            ));
        }
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(Error::HijackUnavailable)?;
        let (parts, _body) = req.into_parts();

        let transport = self.ctx.transport();
        let target = match transport.proxy_for(&parts) {
            Some(proxy) => proxy
                .authority()
                .map(|authority| ensure_port(authority.as_str()))
                .ok_or_else(|| Error::InvalidTarget(proxy.to_string()))?,
            None => {
                let authority = parts
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
                ensure_port(&authority)
            }
        };

        let mut upstream = transport.dial(&target).await?;

        // Relay the handshake: original request verbatim, upstream's reply
        // mirrored back through the server framework.
        write_request_head(&mut upstream, &parts).await?;
        let (head, leftover) = read_response_head(&mut upstream).await?;

        let mut resp = Response::new(empty());
        *resp.status_mut() = StatusCode::from_u16(head.status)
            .map_err(|_| Error::transport(format!("invalid upstream status {}", head.status)))?;
        for (name, value) in &head.headers {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            resp.headers_mut().append(name, value);
        }

        if head.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
            debug!(upstream = %target, status = head.status, "upstream refused websocket upgrade");
            return Ok(resp);
        }

        let buffers = Arc::clone(&self.buffers);
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!(error = %err, "websocket hijack failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                return;
            }
            splice(client, upstream, buffers).await;
        });

        Ok(resp)
    }
}

/// Upgrade detection: `Connection` must carry the `upgrade` token and
/// `Upgrade` the `websocket` token, both case-insensitive, comma-separated.
pub fn is_upgrade_request<B>(req: &http::Request<B>) -> bool {
    header_contains_token(req.headers(), CONNECTION, "upgrade")
        && header_contains_token(req.headers(), UPGRADE, "websocket")
}

fn header_contains_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(connection: &'static str, upgrade: &'static str) -> Request {
        let mut req = Request::new(empty());
        *req.uri_mut() = "http://origin.test/socket".parse().expect("uri");
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static(connection));
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static(upgrade));
        req
    }

    #[test]
    fn detects_standard_upgrade_requests() {
        assert!(is_upgrade_request(&upgrade_request("Upgrade", "websocket")));
        assert!(is_upgrade_request(&upgrade_request(
            "keep-alive, Upgrade",
            "WebSocket"
        )));
    }

    #[test]
    fn rejects_non_upgrade_requests() {
        assert!(!is_upgrade_request(&upgrade_request("keep-alive", "websocket")));
        assert!(!is_upgrade_request(&upgrade_request("Upgrade", "h2c")));
        let plain = Request::new(empty());
        assert!(!is_upgrade_request(&plain));
    }
}
