mod common;

use common::basic_credentials;
use common::read_http_response;
use common::read_until_blank_line;
use common::start_origin;
use common::start_proxy;
use interpose::ConnectHandler;
use interpose::Context;
use interpose::HttpProxy;
use interpose::Transport;
use interpose::TunnelHandler;
use interpose::middleware::BasicAuth;
use interpose::middleware::set_proxy_basic_auth;
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// CONNECT to `target` through the proxy; asserts the tunnel is accepted and
/// returns the open stream.
async fn open_tunnel(proxy: SocketAddr, target: SocketAddr, credentials: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    let auth = credentials
        .map(|value| format!("Proxy-Authorization: {value}\r\n"))
        .unwrap_or_default();
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{auth}\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("write connect");

    let (head, leftover) = read_until_blank_line(&mut stream).await;
    assert!(head.starts_with("HTTP/1.0 200"), "head: {head}");
    assert!(leftover.is_empty(), "unexpected bytes after tunnel accept");
    stream
}

async fn get_through_tunnel(stream: &mut TcpStream, target: SocketAddr) -> (String, Vec<u8>) {
    let get = format!("GET / HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(get.as_bytes()).await.expect("write get");
    read_http_response(stream).await
}

#[tokio::test]
async fn sequential_connects_reuse_the_pooled_upstream() {
    let origin = start_origin("hello world").await;
    let proxy_addr = start_proxy(HttpProxy::new()).await;

    for _ in 0..2 {
        let mut stream = open_tunnel(proxy_addr, origin.addr, None).await;
        let (head, body) = get_through_tunnel(&mut stream, origin.addr).await;
        assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
        assert_eq!(body, b"hello world");
        drop(stream);
        // Let the proxy notice the client close and park the upstream side.
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    // The second tunnel rode the pooled connection.
    assert_eq!(origin.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn released_pool_falls_back_to_dialing() {
    let origin = start_origin("hello world").await;
    let tunnel = TunnelHandler::new();
    let pool = Arc::clone(tunnel.pool());
    let mut proxy = HttpProxy::new();
    proxy.connect = ConnectHandler::Tunnel(tunnel);
    let proxy_addr = start_proxy(proxy).await;

    pool.release().expect("release");

    // With the pool closed every CONNECT dials fresh; the tunnels still work.
    for _ in 0..2 {
        let mut stream = open_tunnel(proxy_addr, origin.addr, None).await;
        let (head, body) = get_through_tunnel(&mut stream, origin.addr).await;
        assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
        assert_eq!(body, b"hello world");
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(origin.accepted.load(Ordering::SeqCst), 2);
}

fn cascade_front(upstream: SocketAddr) -> HttpProxy {
    let mut transport = Transport::new();
    let upstream_uri: http::Uri = format!("http://{upstream}").parse().expect("upstream uri");
    transport.proxy = Some(Arc::new(move |_parts| Some(upstream_uri.clone())));

    let mut ctx = Context::with_transport(Arc::new(transport));
    ctx.use_middleware(BasicAuth::new("r2", |user, password| {
        user == "foo_2" && password == "bar_2"
    }));
    // Authenticate against the next proxy in the cascade.
    ctx.use_fn(|mut req: interpose::Request, ctx: &mut Context| {
        Box::pin(async move {
            set_proxy_basic_auth(&mut req, "foo_1", "bar_1");
            ctx.next(req).await
        })
    });

    let mut proxy = HttpProxy::new();
    proxy.connect = ConnectHandler::Tunnel(TunnelHandler::with_context(ctx));
    proxy
}

#[tokio::test]
async fn cascade_connect_authenticates_both_hops() {
    let origin = start_origin("hello world").await;

    let mut rear = HttpProxy::new();
    rear.use_middleware(BasicAuth::new("r1", |user, password| {
        user == "foo_1" && password == "bar_1"
    }));
    let rear_addr = start_proxy(rear).await;

    let front_addr = start_proxy(cascade_front(rear_addr)).await;

    let credentials = basic_credentials("foo_2", "bar_2");
    let mut stream = open_tunnel(front_addr, origin.addr, Some(&credentials)).await;
    let (head, body) = get_through_tunnel(&mut stream, origin.addr).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert_eq!(body, b"hello world");
}

#[tokio::test]
async fn unauthenticated_connect_gets_the_front_realm_challenge() {
    let origin = start_origin("hello world").await;

    let mut rear = HttpProxy::new();
    rear.use_middleware(BasicAuth::new("r1", |user, password| {
        user == "foo_1" && password == "bar_1"
    }));
    let rear_addr = start_proxy(rear).await;
    let front_addr = start_proxy(cascade_front(rear_addr)).await;

    let mut stream = TcpStream::connect(front_addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n",
        target = origin.addr
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("write connect");

    let (head, body) = read_http_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 407"), "head: {head}");
    assert!(
        head.to_ascii_lowercase()
            .contains("proxy-authenticate: basic realm=r2"),
        "head: {head}"
    );
    assert_eq!(body, b"407 Proxy Authentication Required");
}

#[tokio::test]
async fn wrong_cascade_credentials_refuse_the_tunnel() {
    let origin = start_origin("hello world").await;

    let mut rear = HttpProxy::new();
    rear.use_middleware(BasicAuth::new("r1", |user, password| {
        user == "someone_else" && password == "entirely"
    }));
    let rear_addr = start_proxy(rear).await;
    let front_addr = start_proxy(cascade_front(rear_addr)).await;

    // Front accepts the client, but the rear proxy rejects the cascade
    // credentials, so the tunnel is refused with 502.
    let credentials = basic_credentials("foo_2", "bar_2");
    let mut stream = TcpStream::connect(front_addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {credentials}\r\n\r\n",
        target = origin.addr
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("write connect");

    let (head, _body) = read_http_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "head: {head}");
}
