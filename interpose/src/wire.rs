use crate::buffer::BufferPool;
use bytes::Bytes;
use http::Method;
use http::request::Parts;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Serializes a request head for hand-written delivery to an upstream that
/// hyper does not manage for us: the cascade CONNECT and the websocket
/// handshake. The body (both cases have none) is not written.
pub(crate) async fn write_request_head<W>(writer: &mut W, parts: &Parts) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let target = if parts.method == Method::CONNECT {
        parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_else(|| parts.uri.to_string())
    } else {
        parts.uri.to_string()
    };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, target).as_bytes());
    for (name, value) in &parts.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    writer.flush().await
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Reads one HTTP/1.x response head off a raw stream. Returns the parsed
/// head plus any bytes that arrived after it (the upstream may have started
/// streaming payload already; the caller must replay them).
pub(crate) async fn read_response_head<R>(reader: &mut R) -> std::io::Result<(ResponseHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    const MAX_HEAD: usize = 64 * 1024;
    const TERMINATOR: &[u8] = b"\r\n\r\n";

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(pos) = buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR) {
            break pos + TERMINATOR.len();
        }
        if buf.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_text = String::from_utf8_lossy(&buf[..end]);
    let mut lines = head_text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed status line: {status_line:?}"),
        )
    })?;
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok((
        ResponseHead { status, headers },
        Bytes::copy_from_slice(&buf[end..]),
    ))
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut fields = line.split_ascii_whitespace();
    let proto = fields.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    fields.next()?.parse().ok()
}

/// One splice direction through a pooled buffer. Returns the byte count once
/// the reader reaches EOF.
pub(crate) async fn copy_with_pool<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffers: &dyn BufferPool,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = buffers.get();
    let mut total = 0u64;
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                total += n as u64;
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    break Err(err);
                }
            }
            Err(err) => break Err(err),
        }
    };
    buffers.put(buf);
    if result.is_ok() {
        writer.flush().await?;
    }
    result
}

/// Bidirectional splice for sessions whose upstream is never reused (the
/// websocket pass-through). Each direction propagates EOF with a shutdown so
/// half-closed peers drain cleanly.
pub(crate) async fn splice<C, U>(client: C, upstream: U, buffers: Arc<dyn BufferPool>)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let upload = tokio::spawn({
        let buffers = Arc::clone(&buffers);
        async move {
            let _ = copy_with_pool(&mut client_rd, &mut upstream_wr, buffers.as_ref()).await;
            let _ = upstream_wr.shutdown().await;
        }
    });

    let _ = copy_with_pool(&mut upstream_rd, &mut client_wr, buffers.as_ref()).await;
    let _ = client_wr.shutdown().await;
    upload.abort();
}
