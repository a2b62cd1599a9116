//! Remote forwarding: the server listens, we connect to `local_host:local_port`.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use common::{format_target, LogLevel, Phase};
use ssh::{InboundChannel, RemoteListener, Session};

use crate::connection::ForwardContext;

/// Serves one remote listener until its session goes away or the tunnel stops.
///
/// Returns so the caller can register a fresh listener on the next session.
pub async fn serve<S: Session>(
    mut listener: RemoteListener<S::Channel>,
    session: Arc<S>,
    local_host: String,
    local_port: u16,
    connect_timeout: Duration,
    ctx: ForwardContext<S>,
) {
    let bound_port = listener.bound_port();
    loop {
        let inbound = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = session.closed() => break,
            inbound = listener.accept() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let conn = ctx.log.next_connection();
        tokio::spawn(handle(
            inbound,
            Arc::clone(&session),
            conn,
            local_host.clone(),
            local_port,
            connect_timeout,
            ctx.clone(),
        ));
    }
    debug!(tunnel = ctx.log.tunnel_id(), bound_port, "remote listener finished");
}

async fn handle<S: Session>(
    inbound: InboundChannel<S::Channel>,
    session: Arc<S>,
    conn: u64,
    local_host: String,
    local_port: u16,
    connect_timeout: Duration,
    ctx: ForwardContext<S>,
) {
    let InboundChannel { stream, originator } = inbound;
    let local = format_target(&local_host, local_port);
    let connect = TcpStream::connect((local_host.as_str(), local_port));
    let Some(connected) = ctx
        .unless_stopped(tokio::time::timeout(connect_timeout, connect))
        .await
    else {
        return;
    };
    let socket = match connected {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Channel,
                format!("connection from {originator} dropped: cannot reach {local}: {e}"),
            );
            return;
        }
        Err(_) => {
            ctx.log.conn(
                conn,
                LogLevel::Warn,
                Phase::Channel,
                format!("connection from {originator} dropped: connecting to {local} timed out"),
            );
            return;
        }
    };
    let _ = socket.set_nodelay(true);
    ctx.log.conn(
        conn,
        LogLevel::Debug,
        Phase::Channel,
        format!("{originator} -> {local}"),
    );
    ctx.relay(conn, socket, stream, &session).await;
}
