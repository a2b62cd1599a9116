//! Reaching the SSH server, directly or through an upstream proxy.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use common::{format_target, Error, ProxyKind, Result, UpstreamProxy};

const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Opens a TCP stream to `host:port`, tunnelled through `proxy` when given.
pub async fn dial(host: &str, port: u16, proxy: Option<&UpstreamProxy>) -> Result<TcpStream> {
    let target = format_target(host, port);
    let Some(proxy) = proxy else {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Network(format!("connect to {target} failed: {e}")))?;
        stream.set_nodelay(true)?;
        return Ok(stream);
    };

    let via = format_target(&proxy.host, proxy.port);
    debug!(%target, %via, kind = ?proxy.kind, "dialing through upstream proxy");
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| Error::Network(format!("connect to proxy {via} failed: {e}")))?;
    stream.set_nodelay(true)?;

    match proxy.kind {
        ProxyKind::Http => http_connect(&mut stream, host, port).await?,
        ProxyKind::Socks5 => {
            let auth = proxy.username.as_deref().map(|user| {
                (user, proxy.password.as_deref().unwrap_or_default())
            });
            socks5_connect(&mut stream, host, port, auth).await?
        }
    }
    Ok(stream)
}

// ---------------------------------------------------------------------------
// HTTP CONNECT
// ---------------------------------------------------------------------------

/// Sends `CONNECT` and consumes the response head, nothing more: the SSH
/// banner may already follow it in the same segment.
pub async fn http_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_target(host, port);
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(Error::Network("upstream proxy response head too large".into()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::Network(
                "upstream proxy closed the connection during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse::<u16>().ok());
    match code {
        Some(code) if version.starts_with("HTTP/") && (200..300).contains(&code) => Ok(()),
        _ => Err(Error::Network(format!(
            "upstream proxy refused CONNECT {authority}: {status_line}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// SOCKS5
// ---------------------------------------------------------------------------

/// SOCKS5 CONNECT, with RFC 1929 username/password when `auth` is set.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if auth.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(Error::Network(format!(
            "upstream proxy is not SOCKS5 (version {:#04x})",
            choice[0]
        )));
    }
    match (choice[1], auth) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::Config("SOCKS5 username/password longer than 255 bytes".into()));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Auth("upstream SOCKS5 proxy rejected username/password".into()));
            }
        }
        (0xFF, _) => {
            return Err(Error::Auth(
                "upstream SOCKS5 proxy accepted none of the offered auth methods".into(),
            ));
        }
        (method, _) => {
            return Err(Error::Network(format!(
                "upstream SOCKS5 proxy chose unsupported method {method:#04x}"
            )));
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(Error::Config(format!("hostname too long for SOCKS5: {host}")));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::Network(format!(
            "upstream SOCKS5 proxy could not reach {}: reply {:#04x}",
            format_target(host, port),
            reply[1]
        )));
    }
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(Error::Network(format!(
                "upstream SOCKS5 proxy sent unknown address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_http_connect_stops_at_head() {
        let (mut client, mut proxy) = duplex(4096);
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = proxy.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\nSSH-2.0-Fake\r\n")
                .await
                .unwrap();
            req
        });

        http_connect(&mut client, "bastion.example", 22).await.unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT bastion.example:22 HTTP/1.1\r\n"));

        let mut banner = [0u8; 14];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-Fake\r\n");
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let (mut client, mut proxy) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        });
        let err = http_connect(&mut client, "::1", 22).await.unwrap_err();
        assert!(matches!(err, Error::Network(ref m) if m.contains("403")), "{err}");
    }

    #[tokio::test]
    async fn test_socks5_domain_no_auth() {
        let (mut client, mut proxy) = duplex(4096);
        let server = tokio::spawn(async move {
            let mut greet = [0u8; 3];
            proxy.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [0x05, 0x01, 0x00]);
            proxy.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            proxy.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            proxy.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"bastion");
            assert_eq!(&rest[head[4] as usize..], &22u16.to_be_bytes());

            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        socks5_connect(&mut client, "bastion", 22, None).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_password_rejected() {
        let (mut client, mut proxy) = duplex(4096);
        tokio::spawn(async move {
            let mut greet = [0u8; 4];
            proxy.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [0x05, 0x02, 0x00, 0x02]);
            proxy.write_all(&[0x05, 0x02]).await.unwrap();

            let mut ver_ulen = [0u8; 2];
            proxy.read_exact(&mut ver_ulen).await.unwrap();
            let mut user = vec![0u8; ver_ulen[1] as usize];
            proxy.read_exact(&mut user).await.unwrap();
            assert_eq!(user, b"alice");
            let mut plen = [0u8; 1];
            proxy.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            proxy.read_exact(&mut pass).await.unwrap();
            proxy.write_all(&[0x01, 0x01]).await.unwrap();
        });
        let err = socks5_connect(&mut client, "10.0.0.1", 22, Some(("alice", "wrong")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "{err}");
    }

    #[tokio::test]
    async fn test_socks5_failure_reply() {
        let (mut client, mut proxy) = duplex(4096);
        tokio::spawn(async move {
            let mut greet = [0u8; 3];
            proxy.read_exact(&mut greet).await.unwrap();
            proxy.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            proxy.read_exact(&mut req).await.unwrap();
            assert_eq!(req[3], 0x01);
            proxy
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let err = socks5_connect(&mut client, "10.0.0.1", 22, None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("0x05"), "{err}");
    }

    #[tokio::test]
    async fn test_dial_direct_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = dial("127.0.0.1", port, None).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "{err}");
    }
}
