use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Msg};
use russh::{ChannelOpenFailure, ChannelStream, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{format_target, ChannelError, ChannelFailure, Error, Result};

use crate::handler::{ClientHandler, RouteTable};

/// Inbound connections buffered per remote listener before new ones are refused.
const REMOTE_BACKLOG: usize = 64;

const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// One authenticated connection to an SSH server.
///
/// Channel opens may be issued concurrently from many tasks; implementations
/// serialize them internally. Once [`Session::closed`] resolves every channel
/// derived from the session should be treated as dead.
pub trait Session: Send + Sync + 'static {
    type Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Incremented by the manager for every successful connect.
    fn generation(&self) -> u64;

    /// Opens a direct-tcpip channel to `host:port` as seen from the server.
    fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> impl Future<Output = Result<Self::Channel>> + Send;

    /// Asks the server to listen on `bind_host:bind_port` and hand us the
    /// connections it accepts. Port 0 lets the server choose.
    fn listen_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> impl Future<Output = Result<RemoteListener<Self::Channel>>> + Send;

    /// Resolves once the transport is gone.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Produces sessions; one call is one bounded connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self, generation: u64) -> impl Future<Output = Result<Self::Session>> + Send;
}

impl<C: Connector> Connector for Arc<C> {
    type Session = C::Session;

    fn connect(&self, generation: u64) -> impl Future<Output = Result<Self::Session>> + Send {
        (**self).connect(generation)
    }
}

/// A connection the server accepted on a remote-forwarded port.
pub struct InboundChannel<C> {
    pub stream: C,
    /// `host:port` of the peer that connected to the server.
    pub originator: String,
}

/// Lazy sequence of inbound channels for one remote forward.
///
/// Dropping the listener releases the forward on the server.
pub struct RemoteListener<C> {
    bound_port: u16,
    incoming: mpsc::Receiver<InboundChannel<C>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl<C> RemoteListener<C> {
    pub fn new(bound_port: u16, incoming: mpsc::Receiver<InboundChannel<C>>) -> Self {
        Self {
            bound_port,
            incoming,
            release: None,
        }
    }

    /// Runs `release` when the listener is dropped.
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// The port the server actually bound.
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// `None` once the session that created the listener is gone.
    pub async fn accept(&mut self) -> Option<InboundChannel<C>> {
        self.incoming.recv().await
    }
}

impl<C> Drop for RemoteListener<C> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ---------------------------------------------------------------------------
// SshSession
// ---------------------------------------------------------------------------

pub struct SshSession {
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    routes: RouteTable<ChannelStream<Msg>>,
    generation: u64,
    closed: CancellationToken,
    channel_open_timeout: Duration,
    monitor: JoinHandle<()>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("generation", &self.generation)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    pub(crate) fn new(
        handle: client::Handle<ClientHandler>,
        routes: RouteTable<ChannelStream<Msg>>,
        generation: u64,
        channel_open_timeout: Duration,
    ) -> Self {
        let handle = Arc::new(Mutex::new(handle));
        let closed = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            Arc::clone(&handle),
            routes.clone(),
            closed.clone(),
            generation,
        ));
        Self {
            handle,
            routes,
            generation,
            closed,
            channel_open_timeout,
            monitor,
        }
    }
}

/// Watches the russh handle and trips `closed` when the transport dies.
async fn monitor(
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    routes: RouteTable<ChannelStream<Msg>>,
    closed: CancellationToken,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Busy handle means a request is in flight; check again next tick.
        let dead = match handle.try_lock() {
            Ok(h) => h.is_closed(),
            Err(_) => false,
        };
        if dead {
            warn!(generation, "SSH transport closed");
            closed.cancel();
            break;
        }
    }
    routes.clear();
}

fn channel_error(err: russh::Error, host: &str, port: u16) -> Error {
    let kind = match err {
        russh::Error::ChannelOpenFailure(ChannelOpenFailure::ConnectFailed) => {
            ChannelFailure::Refused
        }
        russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited) => {
            ChannelFailure::Prohibited
        }
        russh::Error::ChannelOpenFailure(_) => ChannelFailure::Other,
        other => {
            debug!(error = %other, "channel open failed at the transport");
            ChannelFailure::SessionUnavailable
        }
    };
    ChannelError::new(kind, host, port).into()
}

impl Session for SshSession {
    type Channel = ChannelStream<Msg>;

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Self::Channel> {
        if self.is_closed() {
            return Err(ChannelError::new(ChannelFailure::SessionUnavailable, host, port).into());
        }
        let open = async {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(
                    host,
                    u32::from(port),
                    originator.ip().to_string(),
                    u32::from(originator.port()),
                )
                .await
        };
        match tokio::time::timeout(self.channel_open_timeout, open).await {
            Ok(Ok(channel)) => Ok(channel.into_stream()),
            Ok(Err(e)) => Err(channel_error(e, host, port)),
            Err(_) => Err(ChannelError::new(ChannelFailure::TimedOut, host, port).into()),
        }
    }

    async fn listen_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<RemoteListener<Self::Channel>> {
        let target = format_target(bind_host, bind_port);
        if self.is_closed() {
            return Err(Error::Network(format!(
                "cannot listen on {target}: session is closed"
            )));
        }

        let bound = {
            let mut handle = self.handle.lock().await;
            let result = tokio::time::timeout(
                self.channel_open_timeout,
                handle.tcpip_forward(bind_host, u32::from(bind_port)),
            )
            .await;
            match result {
                Ok(Ok(port)) => port,
                Ok(Err(e)) if handle.is_closed() => {
                    return Err(Error::Network(format!(
                        "session lost while requesting {target}: {e}"
                    )));
                }
                Ok(Err(e)) => {
                    return Err(Error::RemoteBind(format!(
                        "server refused to listen on {target}: {e}"
                    )));
                }
                Err(_) => {
                    return Err(Error::Network(format!(
                        "remote forward request for {target} timed out"
                    )));
                }
            }
        };
        let bound_port = match u16::try_from(bound) {
            Ok(0) | Err(_) => bind_port,
            Ok(p) => p,
        };

        let (tx, rx) = mpsc::channel(REMOTE_BACKLOG);
        self.routes.insert(bind_host, u32::from(bound_port), tx);
        info!(bind = %format_target(bind_host, bound_port), "remote forward registered");

        let routes = self.routes.clone();
        let handle = Arc::clone(&self.handle);
        let closed = self.closed.clone();
        let host = bind_host.to_string();
        let listener = RemoteListener::new(bound_port, rx).on_release(move || {
            routes.remove(&host, u32::from(bound_port));
            if closed.is_cancelled() {
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                let handle = handle.lock().await;
                if let Err(e) = handle
                    .cancel_tcpip_forward(host.as_str(), u32::from(bound_port))
                    .await
                {
                    debug!(error = %e, port = bound_port, "failed to cancel remote forward");
                }
            });
        });
        Ok(listener)
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
        self.routes.clear();
        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(error = %e, generation = self.generation, "disconnect on a dead session");
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.closed.cancel();
        self.monitor.abort();
    }
}
