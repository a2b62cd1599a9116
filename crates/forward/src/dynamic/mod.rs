//! Dynamic forwarding: one listener serving SOCKS5 and HTTP CONNECT clients.
//!
//! The protocol is chosen per connection from the first byte, peeked so the
//! selected handler still sees the complete request.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use common::{format_target, DynamicOptions, LogLevel, Phase};
use ssh::Session;

use crate::connection::ForwardContext;
use crate::local::ACCEPT_BACKOFF;

mod http;
mod socks5;

/// Limit for a client to complete its SOCKS5 or HTTP negotiation.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Http,
    Unknown,
}

/// Every HTTP method token starts with an uppercase ASCII letter; SOCKS5
/// greetings start with the version byte.
pub fn detect(first: u8) -> Protocol {
    match first {
        0x05 => Protocol::Socks5,
        b'A'..=b'Z' => Protocol::Http,
        _ => Protocol::Unknown,
    }
}

/// Destination requested by a proxy client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_target(&self.host, self.port))
    }
}

pub async fn serve<S: Session>(
    listener: TcpListener,
    options: DynamicOptions,
    ctx: ForwardContext<S>,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(tunnel = ctx.log.tunnel_id(), "failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let conn = ctx.log.next_connection();
        debug!(tunnel = ctx.log.tunnel_id(), conn, %peer, "accepted proxy client");
        tokio::spawn(handle(socket, peer, conn, options, ctx.clone()));
    }
    debug!(tunnel = ctx.log.tunnel_id(), "proxy listener stopped");
}

async fn handle<S: Session>(
    socket: TcpStream,
    peer: SocketAddr,
    conn: u64,
    options: DynamicOptions,
    ctx: ForwardContext<S>,
) {
    let _ = socket.set_nodelay(true);
    let mut first = [0u8; 1];
    let peeked = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        peeked = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.peek(&mut first)) => peeked,
    };
    match peeked {
        Ok(Ok(0)) => {
            debug!(tunnel = ctx.log.tunnel_id(), conn, %peer, "closed before sending a request");
            return;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!(tunnel = ctx.log.tunnel_id(), conn, %peer, "read failed: {e}");
            return;
        }
        Err(_) => {
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Handshake,
                format!("{peer} sent nothing within {HANDSHAKE_TIMEOUT:?}"),
            );
            return;
        }
    }

    match detect(first[0]) {
        Protocol::Socks5 => socks5::serve(socket, peer, conn, options, &ctx).await,
        Protocol::Http => http::serve(socket, peer, conn, &ctx).await,
        Protocol::Unknown => ctx.log.conn(
            conn,
            LogLevel::Warn,
            Phase::Handshake,
            format!(
                "unrecognized proxy protocol from {peer} (first byte {:#04x})",
                first[0]
            ),
        ),
    }
}
