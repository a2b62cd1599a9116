//! Local forwarding: `local_host:local_port` -> `remote_host:remote_port`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use common::{format_target, Error, LogLevel, Phase};
use ssh::Session;

use crate::connection::ForwardContext;

/// Pause after a failed `accept` so fd exhaustion does not spin the loop.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts on `listener` until cancelled, relaying each connection to
/// `host:port` through the current session.
pub async fn serve<S: Session>(
    listener: TcpListener,
    host: String,
    port: u16,
    ctx: ForwardContext<S>,
) {
    let target = format_target(&host, port);
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
        debug!(tunnel = ctx.log.tunnel_id(), conn, %peer, "accepted");
        tokio::spawn(handle(socket, peer, conn, host.clone(), port, ctx.clone()));
    }
    debug!(tunnel = ctx.log.tunnel_id(), %target, "local listener stopped");
}

async fn handle<S: Session>(
    socket: TcpStream,
    peer: SocketAddr,
    conn: u64,
    host: String,
    port: u16,
    ctx: ForwardContext<S>,
) {
    let _ = socket.set_nodelay(true);
    let (session, channel) = match ctx.open_channel(&host, port, peer).await {
        Ok(opened) => opened,
        Err(Error::Cancelled) => return,
        Err(e) => {
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Channel,
                format!("rejected {peer}: {e}"),
            );
            return;
        }
    };
    ctx.log.conn(
        conn,
        LogLevel::Debug,
        Phase::Channel,
        format!("{peer} -> {}", format_target(&host, port)),
    );
    ctx.relay(conn, socket, channel, &session).await;
}
