use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use russh::client::{self, Msg};
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::HostKeyPolicy;

use crate::session::InboundChannel;

// ---------------------------------------------------------------------------
// Remote forward routing
// ---------------------------------------------------------------------------

type RouteKey = (String, u32);

/// Maps a server-side bind `(address, port)` to the listener that owns it.
pub(crate) struct RouteTable<C> {
    inner: Arc<Mutex<HashMap<RouteKey, mpsc::Sender<InboundChannel<C>>>>>,
}

impl<C> Clone for RouteTable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Default for RouteTable<C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<C> RouteTable<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<RouteKey, mpsc::Sender<InboundChannel<C>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, address: &str, port: u32, tx: mpsc::Sender<InboundChannel<C>>) {
        self.lock().insert((address.to_string(), port), tx);
    }

    pub(crate) fn remove(&self, address: &str, port: u32) {
        self.lock().remove(&(address.to_string(), port));
    }

    /// Exact match first; servers do not always echo the address we asked for.
    pub(crate) fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<InboundChannel<C>>> {
        let routes = self.lock();
        if let Some(tx) = routes.get(&(address.to_string(), port)) {
            return Some(tx.clone());
        }
        let mut by_port = routes.iter().filter(|((_, p), _)| *p == port);
        match (by_port.next(), by_port.next()) {
            (Some((_, tx)), None) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Drops every sender so all listeners observe end-of-stream.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// russh handler
// ---------------------------------------------------------------------------

pub(crate) struct ClientHandler {
    host_key: HostKeyPolicy,
    routes: RouteTable<ChannelStream<Msg>>,
}

impl ClientHandler {
    pub(crate) fn new(host_key: HostKeyPolicy, routes: RouteTable<ChannelStream<Msg>>) -> Self {
        Self { host_key, routes }
    }
}

/// Compares `SHA256:` fingerprints, ignoring the prefix and base64 padding.
pub(crate) fn fingerprints_match(expected: &str, actual: &str) -> bool {
    fn normalize(fp: &str) -> &str {
        let fp = fp.trim();
        let fp = fp.strip_prefix("SHA256:").unwrap_or(fp);
        fp.trim_end_matches('=')
    }
    normalize(expected) == normalize(actual)
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.host_key {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::Fingerprint(expected) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                let accepted = fingerprints_match(expected, &actual);
                if !accepted {
                    warn!(%actual, %expected, "server host key does not match pinned fingerprint");
                }
                Ok(accepted)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let originator = format!("{originator_address}:{originator_port}");
        let Some(tx) = self.routes.lookup(connected_address, connected_port) else {
            debug!(
                address = connected_address,
                port = connected_port,
                "forwarded channel for unknown listener, closing"
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let inbound = InboundChannel {
            stream: channel.into_stream(),
            originator,
        };
        if let Err(e) = tx.try_send(inbound) {
            warn!(port = connected_port, "remote listener not accepting: {e}");
        }
        Ok(())
    }
}
