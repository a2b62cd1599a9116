use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use common::{Error, Phase, ReconnectPolicy, Result, TunnelLog};

use crate::backoff::Backoff;
use crate::session::{Connector, Session};

// ---------------------------------------------------------------------------
// SessionSlot
// ---------------------------------------------------------------------------

/// Read side of the current session. Clone freely.
pub struct SessionSlot<S> {
    rx: watch::Receiver<Option<Arc<S>>>,
}

impl<S> Clone for SessionSlot<S> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<S: Session> SessionSlot<S> {
    /// The live session, or `None` while connecting or reconnecting.
    pub fn current(&self) -> Option<Arc<S>> {
        self.rx
            .borrow()
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Resolves once `generation` is no longer the published session.
    pub async fn replaced(&self, generation: u64) {
        let mut rx = self.rx.clone();
        let _ = rx
            .wait_for(|s| s.as_ref().map_or(true, |s| s.generation() != generation))
            .await;
    }

    /// Resolves when `session` dies or is replaced, whichever comes first.
    pub async fn lost(&self, session: &S) {
        tokio::select! {
            _ = session.closed() => {}
            _ = self.replaced(session.generation()) => {}
        }
    }

    /// Waits for a live session. `None` once the manager is gone.
    pub async fn available(&self) -> Option<Arc<S>> {
        let mut rx = self.rx.clone();
        loop {
            let published = rx.borrow_and_update().clone();
            if let Some(session) = published.filter(|s| !s.is_closed()) {
                return Some(session);
            }
            rx.changed().await.ok()?;
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns the session of one tunnel. Single writer; readers use [`SessionSlot`].
pub struct SessionManager<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    tx: watch::Sender<Option<Arc<C::Session>>>,
    generation: u64,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            connector,
            policy,
            tx,
            generation: 0,
        }
    }

    pub fn slot(&self) -> SessionSlot<C::Session> {
        SessionSlot {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Option<Arc<C::Session>> {
        self.tx.borrow().clone()
    }

    /// One connection attempt; publishes the new session on success.
    pub async fn connect(&mut self) -> Result<Arc<C::Session>> {
        self.generation += 1;
        let session = Arc::new(self.connector.connect(self.generation).await?);
        self.tx.send_replace(Some(Arc::clone(&session)));
        Ok(session)
    }

    /// Drops the current session and retries until connected.
    ///
    /// `on_attempt` is called with the attempt number before each try. Returns
    /// `Auth` errors immediately, `Cancelled` when `cancel` fires and a
    /// `Network` error once `max_attempts` is spent.
    pub async fn reconnect(
        &mut self,
        log: &TunnelLog,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32),
    ) -> Result<Arc<C::Session>> {
        self.invalidate().await;
        if !self.policy.enabled {
            return Err(Error::Network(
                "session lost and automatic reconnect is disabled".into(),
            ));
        }

        let mut backoff = Backoff::new(&self.policy);
        let mut last_error: Option<String> = None;
        loop {
            if let Some(max) = self.policy.max_attempts {
                if backoff.attempt() >= max {
                    let last = last_error.unwrap_or_else(|| "no attempt made".into());
                    log.error(
                        Phase::Reconnect,
                        format!("giving up after {max} attempts: {last}"),
                    );
                    return Err(Error::Network(format!(
                        "reconnect budget of {max} attempts exhausted: {last}"
                    )));
                }
            }

            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            match &last_error {
                Some(last) => log.info(
                    Phase::Reconnect,
                    format!("attempt {attempt} in {delay:.1?} (last error: {last})"),
                ),
                None => log.info(Phase::Reconnect, format!("attempt {attempt} in {delay:.1?}")),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            on_attempt(attempt);

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.connect() => result,
            };
            match result {
                Ok(session) => {
                    log.info(
                        Phase::Reconnect,
                        format!("reconnected on attempt {attempt} (session {})", session.generation()),
                    );
                    return Ok(session);
                }
                Err(e @ Error::Auth(_)) => {
                    log.error(Phase::Reconnect, format!("attempt {attempt} failed: {e}"));
                    return Err(e);
                }
                Err(e) => {
                    log.warn(Phase::Reconnect, format!("attempt {attempt} failed: {e}"));
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Unpublishes and closes the current session.
    pub async fn close(&mut self) {
        self.invalidate().await;
    }

    async fn invalidate(&mut self) {
        if let Some(old) = self.tx.send_replace(None) {
            old.close().await;
        }
    }
}
