use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::{format_target, Error, LogSink, Phase, Result, TunnelConfig, TunnelLog, TunnelMode};
use ssh::{Connector, Session, SessionManager};

use crate::connection::ForwardContext;
use crate::{dynamic, local, remote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub last_error: Option<String>,
    /// Current reconnect attempt; 0 while connected.
    pub attempt: u32,
    /// Where Local and Dynamic tunnels accept connections.
    pub local_addr: Option<SocketAddr>,
    /// Port the server bound for a Remote tunnel.
    pub remote_port: Option<u16>,
}

impl TunnelStatus {
    fn stopped() -> Self {
        Self {
            state: TunnelState::Stopped,
            last_error: None,
            attempt: 0,
            local_addr: None,
            remote_port: None,
        }
    }
}

struct Run {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives one tunnel: connect, serve, reconnect, stop.
pub struct Supervisor<C: Connector> {
    config: Arc<TunnelConfig>,
    connector: Arc<C>,
    log: TunnelLog,
    status: Arc<watch::Sender<TunnelStatus>>,
    run: Mutex<Option<Run>>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(config: TunnelConfig, connector: C, sink: Arc<dyn LogSink>) -> Self {
        let log = TunnelLog::new(config.id.clone(), sink);
        let (status, _) = watch::channel(TunnelStatus::stopped());
        Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            log,
            status: Arc::new(status),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    /// Resolves with the first status matching `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&TunnelStatus) -> bool) -> TunnelStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| predicate(s)).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    /// Validates the configuration and starts connecting in the background.
    ///
    /// Starting a tunnel that is already active is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if let Some(active) = run.as_ref() {
            if !active.task.is_finished() {
                debug!(tunnel = %self.config.id, "start ignored, already active");
                return Ok(());
            }
        }

        if let Err(e) = self.config.validate() {
            self.log.error(Phase::Connect, e.to_string());
            self.status.send_modify(|s| {
                *s = TunnelStatus::stopped();
                s.state = TunnelState::Failed;
                s.last_error = Some(e.to_string());
            });
            return Err(e);
        }

        self.status.send_modify(|s| {
            *s = TunnelStatus::stopped();
            s.state = TunnelState::Connecting;
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            self.log.clone(),
            Arc::clone(&self.status),
            cancel.clone(),
        ));
        *run = Some(Run { cancel, task });
        Ok(())
    }

    /// Cancels listeners and relays, closes the session and waits until the
    /// tunnel is stopped.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(active) = run.take() else {
            return;
        };
        self.status.send_modify(|s| s.state = TunnelState::Stopping);
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            debug!(tunnel = %self.config.id, "supervisor task ended abnormally: {e}");
        }
        self.status.send_replace(TunnelStatus::stopped());
        self.log.info(Phase::Stop, "tunnel stopped");
    }
}

impl<C: Connector> Drop for Supervisor<C> {
    fn drop(&mut self) {
        if let Ok(mut run) = self.run.try_lock() {
            if let Some(active) = run.take() {
                active.cancel.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

async fn supervise<C: Connector>(
    config: Arc<TunnelConfig>,
    connector: Arc<C>,
    log: TunnelLog,
    status: Arc<watch::Sender<TunnelStatus>>,
    cancel: CancellationToken,
) {
    let mut manager = SessionManager::new(connector, config.reconnect.clone());
    let outcome = drive(&config, &mut manager, &log, &status, &cancel).await;
    manager.close().await;

    match outcome {
        Err(Error::Cancelled) => {}
        Err(e) => {
            log.error(Phase::Stop, format!("tunnel failed: {e}"));
            status.send_modify(|s| {
                s.state = TunnelState::Failed;
                s.last_error = Some(e.to_string());
                s.local_addr = None;
                s.remote_port = None;
            });
        }
        Ok(()) => {}
    }
}

async fn drive<C: Connector>(
    config: &TunnelConfig,
    manager: &mut SessionManager<Arc<C>>,
    log: &TunnelLog,
    status: &watch::Sender<TunnelStatus>,
    cancel: &CancellationToken,
) -> Result<()> {
    let record_attempt = |attempt: u32| status.send_modify(|s| s.attempt = attempt);

    log.info(Phase::Connect, format!("connecting ({})", config.rule()));
    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = manager.connect() => result,
    };
    let mut session = match first {
        Ok(session) => session,
        Err(e) if e.is_retryable() && config.reconnect.enabled => {
            log.warn(Phase::Connect, format!("initial connect failed: {e}"));
            status.send_modify(|s| s.last_error = Some(e.to_string()));
            manager.reconnect(log, cancel, record_attempt).await?
        }
        Err(e) => return Err(e),
    };

    // Listeners and relays stop with the supervisor, whatever the reason.
    let serving = cancel.child_token();
    let _serving_guard = serving.clone().drop_guard();
    let ctx = ForwardContext::new(manager.slot(), log.clone(), serving.clone());

    let local_listener = match config.mode {
        TunnelMode::Local | TunnelMode::Dynamic => {
            let listener = bind_local(config).await?;
            let addr = listener.local_addr()?;
            log.info(Phase::Listen, format!("listening on {addr}"));
            status.send_modify(|s| s.local_addr = Some(addr));
            Some(listener)
        }
        TunnelMode::Remote => None,
    };
    let _listener_task = local_listener.map(|listener| {
        let ctx = ctx.clone();
        let task: JoinHandle<()> = match config.mode {
            TunnelMode::Dynamic => tokio::spawn(dynamic::serve(listener, config.dynamic, ctx)),
            _ => tokio::spawn(local::serve(
                listener,
                config.remote_host.clone(),
                config.remote_port,
                ctx,
            )),
        };
        AbortOnDrop(task)
    });

    loop {
        let remote_listener = match config.mode {
            TunnelMode::Remote => {
                let requested = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    result = session.listen_remote(&config.remote_host, config.remote_port) => result,
                };
                match requested {
                    Ok(listener) => {
                        let port = listener.bound_port();
                        log.info(
                            Phase::Listen,
                            format!(
                                "server listening on {} -> {}",
                                format_target(&config.remote_host, port),
                                format_target(&config.local_host, config.local_port)
                            ),
                        );
                        status.send_modify(|s| s.remote_port = Some(port));
                        Some(listener)
                    }
                    Err(e @ Error::RemoteBind(_)) => return Err(e),
                    Err(e) => {
                        log.warn(Phase::Listen, format!("remote forward request failed: {e}"));
                        None
                    }
                }
            }
            _ => None,
        };

        let established = remote_listener.is_some() || config.mode != TunnelMode::Remote;
        if established {
            status.send_modify(|s| {
                s.state = TunnelState::Running;
                s.attempt = 0;
            });
            log.info(
                Phase::Connect,
                format!("running on session {}", session.generation()),
            );

            let serve = async {
                match remote_listener {
                    Some(listener) => {
                        remote::serve(
                            listener,
                            Arc::clone(&session),
                            config.local_host.clone(),
                            config.local_port,
                            config.timeouts.connect(),
                            ctx.clone(),
                        )
                        .await
                    }
                    None => session.closed().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = serve => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        log.warn(Phase::Reconnect, "SSH session lost");
        status.send_modify(|s| {
            s.state = TunnelState::Reconnecting;
            s.last_error = Some("SSH session lost".into());
            s.remote_port = None;
        });
        session = manager.reconnect(log, cancel, record_attempt).await?;
    }
}

async fn bind_local(config: &TunnelConfig) -> Result<TcpListener> {
    let addr = format_target(&config.local_host, config.local_port);
    TcpListener::bind((config.local_host.as_str(), config.local_port))
        .await
        .map_err(|e| Error::Network(format!("cannot listen on {addr}: {e}")))
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
