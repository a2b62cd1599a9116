mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{MemorySink, TunnelMode};
use forward::{Supervisor, TunnelState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::support::*;

async fn proxy() -> (Supervisor<LoopbackConnector>, LoopbackConnector, Arc<MemorySink>, SocketAddr) {
    let connector = LoopbackConnector::new();
    let sink = MemorySink::new();
    let sup = Supervisor::new(
        tunnel("proxy", TunnelMode::Dynamic, 0, 0),
        connector.clone(),
        sink.clone(),
    );
    sup.start().await.unwrap();
    let addr = wait_state(&sup, TunnelState::Running).await.local_addr.unwrap();
    (sup, connector, sink, addr)
}

fn socks_connect_ipv4(port: u16) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    req.extend_from_slice(&port.to_be_bytes());
    req
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(WAIT, stream.read(&mut byte))
            .await
            .expect("read timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_socks5_connect_and_relay() {
    let echo = EchoServer::start().await;
    let (sup, _connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, [0x05, 0x00]);

    client.write_all(&socks_connect_ipv4(echo.port())).await.unwrap();
    assert_eq!(
        read_n(&mut client, 10).await,
        [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(roundtrip(&mut client, b"\x00\x01binary\xff").await, b"\x00\x01binary\xff");
    sup.stop().await;
}

#[tokio::test]
async fn test_socks5_domain_target() {
    let echo = EchoServer::start().await;
    let (sup, _connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut req = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 9];
    req.extend_from_slice(b"localhost");
    req.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&req).await.unwrap();
    let replies = read_n(&mut client, 12).await;
    assert_eq!(replies[..2], [0x05, 0x00]);
    assert_eq!(replies[3], 0x00);
    assert_eq!(roundtrip(&mut client, b"hi").await, b"hi");
    sup.stop().await;
}

#[tokio::test]
async fn test_socks5_refused_target_then_listener_still_serves() {
    let dead = closed_port().await;
    let echo = EchoServer::start().await;
    let (sup, _connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_n(&mut client, 2).await;
    client.write_all(&socks_connect_ipv4(dead)).await.unwrap();
    let reply = read_n(&mut client, 10).await;
    assert_eq!(reply[1], 0x05, "connection refused");
    assert!(closed_by_peer(&mut client).await);

    let mut next = TcpStream::connect(addr).await.unwrap();
    next.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_n(&mut next, 2).await;
    next.write_all(&socks_connect_ipv4(echo.port())).await.unwrap();
    assert_eq!(read_n(&mut next, 10).await[1], 0x00);
    assert_eq!(roundtrip(&mut next, b"again").await, b"again");
    sup.stop().await;
}

#[tokio::test]
async fn test_http_connect_and_relay_with_early_data() {
    let echo = EchoServer::start().await;
    let (sup, _connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nUser-Agent: test\r\n\r\nearly",
        port = echo.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(read_head(&mut client).await, "HTTP/1.1 200 Connection Established\r\n\r\n");
    assert_eq!(read_n(&mut client, 5).await, b"early");
    assert_eq!(roundtrip(&mut client, b"\x16\x03\x01tls").await, b"\x16\x03\x01tls");
    sup.stop().await;
}

#[tokio::test]
async fn test_http_connect_refused_is_502() {
    let dead = closed_port().await;
    let (sup, _connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{dead} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{head}");
    assert!(closed_by_peer(&mut client).await);
    assert_eq!(sup.status().state, TunnelState::Running);
    sup.stop().await;
}

#[tokio::test]
async fn test_http_get_is_405() {
    let (sup, connector, _sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{head}");
    assert!(head.contains("Allow: CONNECT"));
    assert_eq!(connector.channels_opened(), 0);
    sup.stop().await;
}

#[tokio::test]
async fn test_unknown_protocol_closed_without_channel() {
    let (sup, connector, sink, addr) = proxy().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x16, 0x03, 0x01, 0x00]).await.unwrap();
    assert!(closed_by_peer(&mut client).await);
    eventually("protocol error logged", || sink.contains("unrecognized proxy protocol")).await;
    assert_eq!(connector.channels_opened(), 0);
    sup.stop().await;
}

#[tokio::test]
async fn test_proxy_fails_fast_while_reconnecting() {
    let echo = EchoServer::start().await;
    let connector = LoopbackConnector::new();
    let mut config = tunnel("proxy", TunnelMode::Dynamic, 0, 0);
    config.reconnect.initial_delay_ms = 60_000;
    config.reconnect.max_delay_ms = 60_000;
    let sup = Supervisor::new(config, connector.clone(), MemorySink::new());
    sup.start().await.unwrap();
    let addr = wait_state(&sup, TunnelState::Running).await.local_addr.unwrap();

    connector.kill();
    wait_state(&sup, TunnelState::Reconnecting).await;

    let mut socks = TcpStream::connect(addr).await.unwrap();
    socks.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_n(&mut socks, 2).await;
    socks.write_all(&socks_connect_ipv4(echo.port())).await.unwrap();
    assert_eq!(read_n(&mut socks, 10).await[1], 0x01, "general failure");

    let mut http = TcpStream::connect(addr).await.unwrap();
    http.write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut http).await;
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{head}");

    sup.stop().await;
}

#[tokio::test]
async fn test_stop_drops_clients_mid_handshake() {
    let (sup, connector, _sink, addr) = proxy().await;

    let mut socks = TcpStream::connect(addr).await.unwrap();
    socks.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut socks, 2).await, [0x05, 0x00]);
    // Request header only; the address never follows.
    socks.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut http = TcpStream::connect(addr).await.unwrap();
    http.write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    sup.stop().await;
    assert_eq!(sup.status().state, TunnelState::Stopped);

    let bound = Duration::from_secs(2);
    let started = tokio::time::Instant::now();
    assert!(closed_by_peer(&mut socks).await, "SOCKS5 client left open");
    assert!(closed_by_peer(&mut http).await, "HTTP client left open");
    assert!(started.elapsed() < bound, "clients closed after {:?}", started.elapsed());
    assert_eq!(connector.channels_opened(), 0);
}

#[tokio::test]
async fn test_http_rejection_readable_despite_unread_body() {
    let (sup, connector, _sink, addr) = proxy().await;

    let body = vec![b'x'; 256 * 1024];
    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = client.split();
    let head = format!("POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: {}\r\n\r\n", body.len());

    let send = async {
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&body).await
    };
    let receive = async {
        let mut response = Vec::new();
        let _ = reader.read_to_end(&mut response).await;
        response
    };
    let (_sent, response) = tokio::time::timeout(WAIT, async { tokio::join!(send, receive) })
        .await
        .expect("response timed out");

    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{response}");
    assert_eq!(connector.channels_opened(), 0);
    sup.stop().await;
}
