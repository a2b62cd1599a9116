//! HTTP CONNECT proxying. Other methods are refused, never forwarded.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use common::{Error, LogLevel, Phase};
use ssh::Session;

use super::{Target, HANDSHAKE_TIMEOUT};
use crate::connection::ForwardContext;

/// Request line plus headers.
const MAX_HEAD: usize = 16 * 1024;
const DEFAULT_PORT: u16 = 443;
/// How long a rejected client gets to finish sending before we close.
const REJECT_LINGER: Duration = Duration::from_millis(500);

pub(crate) const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Client went away or the stream failed before the head was complete.
    Closed,
    BadRequest(String),
    MethodNotAllowed(String),
    HeadersTooLarge,
}

impl Rejection {
    /// Response to send back, if the client is still there to read it.
    pub(crate) fn response(&self) -> Option<String> {
        match self {
            Self::Closed => None,
            Self::BadRequest(_) => Some(error_response(400, "Bad Request")),
            Self::MethodNotAllowed(_) => Some(
                "HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
                    .to_string(),
            ),
            Self::HeadersTooLarge => Some(error_response(431, "Request Header Fields Too Large")),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Closed => "client closed before finishing the request".into(),
            Self::BadRequest(why) => format!("bad request: {why}"),
            Self::MethodNotAllowed(method) => format!("method {method} not allowed, only CONNECT"),
            Self::HeadersTooLarge => format!("request head exceeds {MAX_HEAD} bytes"),
        }
    }
}

pub(crate) fn error_response(code: u16, reason: &str) -> String {
    format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}

/// `host:port`, `[v6]:port` or a bare host (port 443).
pub(crate) fn parse_authority(authority: &str) -> Option<Target> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => DEFAULT_PORT,
            tail => tail.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => return None,
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, DEFAULT_PORT),
        }
    };
    if host.is_empty() || port == 0 || host.contains(['/', '@', ' ']) {
        return None;
    }
    Some(Target {
        host: host.to_string(),
        port,
    })
}

fn parse_request_line(line: &[u8]) -> Result<Target, Rejection> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Rejection::BadRequest("request line is not UTF-8".into()))?
        .trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Rejection::BadRequest(format!("malformed request line {line:?}")));
    };
    if !version.starts_with("HTTP/") {
        return Err(Rejection::BadRequest(format!("unknown protocol version {version:?}")));
    }
    if !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(Rejection::BadRequest(format!("invalid method {method:?}")));
    }
    if method != "CONNECT" {
        return Err(Rejection::MethodNotAllowed(method.to_string()));
    }
    parse_authority(target)
        .ok_or_else(|| Rejection::BadRequest(format!("invalid CONNECT target {target:?}")))
}

/// Reads the request head up to the blank line and returns the CONNECT target.
///
/// Headers are read and discarded; anything buffered after the head stays in
/// `reader`.
pub(crate) async fn read_connect<R>(reader: &mut R) -> Result<Target, Rejection>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut line = Vec::with_capacity(256);
    let mut request: Option<Result<Target, Rejection>> = None;
    loop {
        line.clear();
        let remaining = (MAX_HEAD - total) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|_| Rejection::Closed)?;
        total += n;
        if !line.ends_with(b"\n") {
            return Err(if total >= MAX_HEAD {
                Rejection::HeadersTooLarge
            } else {
                Rejection::Closed
            });
        }
        match request {
            None => request = Some(parse_request_line(&line)),
            Some(_) if line == b"\r\n" || line == b"\n" => break,
            Some(_) => {}
        }
    }
    request.unwrap_or(Err(Rejection::Closed))
}

/// Writes an error response and closes our side, then drains whatever the
/// client still sends for a moment so the close is a FIN rather than a reset.
async fn reject(socket: &mut TcpStream, response: &[u8]) {
    if socket.write_all(response).await.is_err() || socket.shutdown().await.is_err() {
        return;
    }
    let mut sink = [0u8; 1024];
    let _ = tokio::time::timeout(REJECT_LINGER, async {
        while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;
}

pub(crate) async fn serve<S: Session>(
    socket: TcpStream,
    peer: SocketAddr,
    conn: u64,
    ctx: &ForwardContext<S>,
) {
    let mut reader = BufReader::new(socket);
    let Some(head) = ctx
        .unless_stopped(tokio::time::timeout(HANDSHAKE_TIMEOUT, read_connect(&mut reader)))
        .await
    else {
        return;
    };
    let target = match head {
        Ok(Ok(target)) => target,
        Ok(Err(rejection)) => {
            if let Some(response) = rejection.response() {
                reject(reader.get_mut(), response.as_bytes()).await;
            }
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Handshake,
                format!("HTTP from {peer}: {}", rejection.describe()),
            );
            return;
        }
        Err(_) => {
            reject(reader.get_mut(), error_response(408, "Request Timeout").as_bytes()).await;
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Handshake,
                format!("HTTP from {peer}: request head timed out"),
            );
            return;
        }
    };
    let early_data = reader.buffer().to_vec();
    let mut socket = reader.into_inner();

    let (session, mut channel) = match ctx.open_channel(&target.host, target.port, peer).await {
        Ok(opened) => opened,
        Err(Error::Cancelled) => return,
        Err(e) => {
            let (code, reason) = match &e {
                Error::Channel(ce) => ce.kind.http_status(),
                _ => (502, "Bad Gateway"),
            };
            reject(&mut socket, error_response(code, reason).as_bytes()).await;
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Channel,
                format!("HTTP CONNECT {target} failed ({code}): {e}"),
            );
            return;
        }
    };

    if let Err(e) = socket.write_all(ESTABLISHED).await {
        ctx.log.conn(conn, LogLevel::Debug, Phase::Handshake, format!("client went away: {e}"));
        return;
    }
    if !early_data.is_empty() {
        if let Err(e) = channel.write_all(&early_data).await {
            ctx.log.conn(conn, LogLevel::Debug, Phase::Relay, format!("tunnel write failed: {e}"));
            return;
        }
    }
    ctx.log.conn(
        conn,
        LogLevel::Info,
        Phase::Channel,
        format!("HTTP CONNECT {peer} -> {target}"),
    );
    ctx.relay(conn, socket, channel, &session).await;
}
