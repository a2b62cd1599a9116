//! Test doubles for the forward crate.
//!
//! [`LoopbackConnector`] hands out sessions whose "SSH server" is this
//! machine: direct channels are plain TCP connections and remote listeners
//! are local `TcpListener`s. Sessions can be killed and connects scripted to
//! fail, which is enough to drive every supervisor transition.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{
    ChannelError, ChannelFailure, Error, ReconnectPolicy, Result, TunnelConfig, TunnelMode,
};
use ssh::{Connector, InboundChannel, RemoteListener, Session};

pub const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// Echoes every connection back to its sender.
pub struct EchoServer {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Self { addr, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes `payload` and reads the same number of bytes back.
pub async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    let (mut reader, mut writer) = stream.split();
    let mut buf = vec![0u8; payload.len()];
    let (written, read) = tokio::time::timeout(WAIT, async {
        tokio::join!(writer.write_all(payload), reader.read_exact(&mut buf))
    })
    .await
    .expect("echo timed out");
    written.unwrap();
    read.unwrap();
    buf
}

/// True once the peer has closed `stream`.
pub async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(WAIT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    connects: AtomicUsize,
    channels_opened: AtomicUsize,
    refuse_remote_bind: AtomicBool,
    script: Mutex<VecDeque<Error>>,
    current: Mutex<Option<CancellationToken>>,
}

pub struct LoopbackSession {
    generation: u64,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl Session for LoopbackSession {
    type Channel = TcpStream;

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn open_direct(&self, host: &str, port: u16, _originator: SocketAddr) -> Result<TcpStream> {
        if self.is_closed() {
            return Err(ChannelError::new(ChannelFailure::SessionUnavailable, host, port).into());
        }
        self.shared.channels_opened.fetch_add(1, Ordering::SeqCst);
        match TcpStream::connect((host, port)).await {
            Ok(stream) => Ok(stream),
            Err(e) => Err(ChannelError::new(ChannelFailure::from_io(&e), host, port).into()),
        }
    }

    async fn listen_remote(&self, bind_host: &str, bind_port: u16) -> Result<RemoteListener<TcpStream>> {
        if self.shared.refuse_remote_bind.load(Ordering::SeqCst) {
            return Err(Error::RemoteBind(format!(
                "tcpip-forward for {bind_host}:{bind_port} denied"
            )));
        }
        let listener = TcpListener::bind((bind_host, bind_port))
            .await
            .map_err(|e| Error::RemoteBind(e.to_string()))?;
        let bound_port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::channel(16);
        let closed = self.closed.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        let inbound = InboundChannel { stream, originator: peer.to_string() };
                        if tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(RemoteListener::new(bound_port, rx).on_release(move || task.abort()))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Cloneable handle; clones share counters and fault injection.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error for the next connect attempt.
    pub fn fail_next(&self, err: Error) {
        self.shared.script.lock().unwrap().push_back(err);
    }

    /// Simulates the transport dying under the current session.
    pub fn kill(&self) {
        if let Some(token) = self.shared.current.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn refuse_remote_bind(&self, refuse: bool) {
        self.shared.refuse_remote_bind.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.shared.channels_opened.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    type Session = LoopbackSession;

    async fn connect(&self, generation: u64) -> Result<LoopbackSession> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.shared.script.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        let closed = CancellationToken::new();
        *self.shared.current.lock().unwrap() = Some(closed.clone());
        Ok(LoopbackSession {
            generation,
            closed,
            shared: Arc::clone(&self.shared),
        })
    }
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        jitter: 0.0,
        ..ReconnectPolicy::default()
    }
}

pub fn tunnel(id: &str, mode: TunnelMode, local_port: u16, remote_port: u16) -> TunnelConfig {
    TunnelConfig {
        id: id.into(),
        name: None,
        mode,
        local_host: "127.0.0.1".into(),
        local_port,
        remote_host: "127.0.0.1".into(),
        remote_port,
        keepalive: Default::default(),
        reconnect: fast_reconnect(),
        timeouts: Default::default(),
        dynamic: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Polls `condition` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_state<C: Connector>(
    supervisor: &forward::Supervisor<C>,
    state: forward::TunnelState,
) -> forward::TunnelStatus {
    tokio::time::timeout(WAIT, supervisor.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("tunnel never reached {state}: {:?}", supervisor.status()))
}
