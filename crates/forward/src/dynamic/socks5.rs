//! SOCKS5 (RFC 1928), no-auth CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{DynamicOptions, Error, LogLevel, Phase, Result};
use ssh::Session;

use super::{Target, HANDSHAKE_TIMEOUT};
use crate::connection::ForwardContext;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub(crate) const REPLY_SUCCEEDED: u8 = 0x00;
pub(crate) const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub(crate) const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub(crate) const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Reply with a zero-filled IPv4 bound address.
pub(crate) fn reply(status: u8) -> [u8; 10] {
    [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Runs the greeting and request exchange, answering protocol errors itself.
pub(crate) async fn negotiate<S>(stream: &mut S) -> Result<Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Protocol(format!("unsupported SOCKS version {:#04x}", head[0])));
    }
    let mut methods = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(Error::Protocol(
            "client offered no acceptable SOCKS5 auth method".into(),
        ));
    }
    stream.write_all(&[VERSION, NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let [version, command, _reserved, atyp] = request;
    if version != VERSION {
        stream.write_all(&reply(REPLY_GENERAL_FAILURE)).await?;
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version {version:#04x} in request"
        )));
    }
    if command != CMD_CONNECT {
        stream.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
        return Err(Error::Protocol(format!(
            "unsupported SOCKS5 command {command:#04x}"
        )));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) if !name.is_empty() => name,
                _ => {
                    stream.write_all(&reply(REPLY_GENERAL_FAILURE)).await?;
                    return Err(Error::Protocol("invalid SOCKS5 domain name".into()));
                }
            }
        }
        other => {
            stream.write_all(&reply(REPLY_ADDRESS_NOT_SUPPORTED)).await?;
            return Err(Error::Protocol(format!(
                "unsupported SOCKS5 address type {other:#04x}"
            )));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(Target {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Resolves a domain target on this machine, keeping the name if that fails.
async fn resolve(target: Target) -> Target {
    if target.host.parse::<std::net::IpAddr>().is_ok() {
        return target;
    }
    let first = tokio::net::lookup_host((target.host.clone(), target.port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next());
    match first {
        Some(addr) => Target {
            host: addr.ip().to_string(),
            port: target.port,
        },
        None => target,
    }
}

pub(crate) async fn serve<S: Session>(
    mut socket: TcpStream,
    peer: SocketAddr,
    conn: u64,
    options: DynamicOptions,
    ctx: &ForwardContext<S>,
) {
    let Some(negotiated) = ctx
        .unless_stopped(tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut socket)))
        .await
    else {
        return;
    };
    let target = match negotiated {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            ctx.log.conn(conn, LogLevel::Warn, Phase::Handshake, format!("SOCKS5 from {peer}: {e}"));
            return;
        }
        Err(_) => {
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Handshake,
                format!("SOCKS5 from {peer}: handshake timed out"),
            );
            return;
        }
    };
    let target = if options.resolve_locally {
        match ctx.unless_stopped(resolve(target)).await {
            Some(target) => target,
            None => return,
        }
    } else {
        target
    };

    let (session, channel) = match ctx.open_channel(&target.host, target.port, peer).await {
        Ok(opened) => opened,
        Err(Error::Cancelled) => return,
        Err(e) => {
            let code = match &e {
                Error::Channel(ce) => ce.kind.socks5_reply(),
                _ => REPLY_GENERAL_FAILURE,
            };
            let _ = socket.write_all(&reply(code)).await;
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Channel,
                format!("SOCKS5 CONNECT {target} failed (reply {code:#04x}): {e}"),
            );
            return;
        }
    };

    if let Err(e) = socket.write_all(&reply(REPLY_SUCCEEDED)).await {
        ctx.log.conn(conn, LogLevel::Debug, Phase::Handshake, format!("client went away: {e}"));
        return;
    }
    ctx.log.conn(
        conn,
        LogLevel::Info,
        Phase::Channel,
        format!("SOCKS5 {peer} -> {target}"),
    );
    ctx.relay(conn, socket, channel, &session).await;
}
