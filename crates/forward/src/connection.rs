use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use common::{ChannelError, ChannelFailure, Error, Result, TunnelLog};
use ssh::{Session, SessionSlot};

use crate::relay::{relay, RelayEnd};

/// What every forwarder needs besides its listener and target.
pub struct ForwardContext<S> {
    pub slot: SessionSlot<S>,
    pub log: TunnelLog,
    /// Stops the listener and every relay it started.
    pub cancel: CancellationToken,
}

impl<S> Clone for ForwardContext<S> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            log: self.log.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: Session> ForwardContext<S> {
    pub fn new(slot: SessionSlot<S>, log: TunnelLog, cancel: CancellationToken) -> Self {
        Self { slot, log, cancel }
    }

    /// Runs `fut` unless the tunnel stops first.
    pub(crate) async fn unless_stopped<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Opens a direct channel on the current session, failing fast with
    /// `SessionUnavailable` while there is none and with `Cancelled` once the
    /// tunnel stops.
    pub(crate) async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<(Arc<S>, S::Channel)> {
        let Some(session) = self.slot.current() else {
            return Err(ChannelError::new(ChannelFailure::SessionUnavailable, host, port).into());
        };
        let channel = self
            .unless_stopped(session.open_direct(host, port, originator))
            .await
            .ok_or(Error::Cancelled)??;
        Ok((session, channel))
    }

    /// Relays `local <-> tunnel` until either side closes, the tunnel stops or
    /// `session` is lost, then logs the byte counts.
    pub(crate) async fn relay<L, T>(&self, conn: u64, local: L, tunnel: T, session: &S)
    where
        L: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.cancel.child_token();
        let stats = {
            let pump = relay(local, tunnel, &cancel);
            tokio::pin!(pump);
            tokio::select! {
                stats = &mut pump => stats,
                _ = self.slot.lost(session) => {
                    cancel.cancel();
                    pump.await
                }
            }
        };

        let why = match &stats.end {
            RelayEnd::AClosed => "closed by local side".to_string(),
            RelayEnd::BClosed => "closed by tunnel side".to_string(),
            RelayEnd::Error(e) => format!("ended with error: {e}"),
            RelayEnd::Cancelled if self.cancel.is_cancelled() => "stopped".to_string(),
            RelayEnd::Cancelled => "dropped: session lost".to_string(),
        };
        self.log.transferred(conn, stats.b_to_a, stats.a_to_b, format!("connection {why}"));
    }
}
