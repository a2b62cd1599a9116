use std::sync::Arc;

use russh::client;
use tracing::info;

use common::{
    format_target, Credential, Error, HostKeyPolicy, KeepalivePolicy, Result, Timeouts,
    UpstreamProxy,
};

use crate::credential;
use crate::dial;
use crate::handler::{ClientHandler, RouteTable};
use crate::session::{Connector, SshSession};

/// Connects to one SSH server with fixed credentials and options.
#[derive(Debug, Clone)]
pub struct SshConnector {
    credential: Credential,
    host_key: HostKeyPolicy,
    proxy: Option<UpstreamProxy>,
    keepalive: KeepalivePolicy,
    timeouts: Timeouts,
}

impl SshConnector {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            host_key: HostKeyPolicy::default(),
            proxy: None,
            keepalive: KeepalivePolicy::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    pub fn proxy(mut self, proxy: Option<UpstreamProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn keepalive(mut self, keepalive: KeepalivePolicy) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            keepalive_interval: self.keepalive.interval(),
            keepalive_max: self.keepalive.max_missed,
            inactivity_timeout: None,
            ..Default::default()
        }
    }

    async fn establish(&self, generation: u64) -> Result<SshSession> {
        let cred = &self.credential;
        let target = format_target(&cred.host, cred.port);

        let stream = dial::dial(&cred.host, cred.port, self.proxy.as_ref()).await?;

        let routes = RouteTable::default();
        let handler = ClientHandler::new(self.host_key.clone(), routes.clone());
        let mut handle = client::connect_stream(Arc::new(self.client_config()), stream, handler)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => {
                    Error::Auth(format!("host key of {target} was rejected"))
                }
                other => Error::Network(format!("SSH handshake with {target} failed: {other}")),
            })?;

        credential::authenticate(&mut handle, cred).await?;
        info!(%target, user = %cred.username, generation, "SSH session established");

        Ok(SshSession::new(
            handle,
            routes,
            generation,
            self.timeouts.channel_open(),
        ))
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, generation: u64) -> Result<SshSession> {
        let limit = self.timeouts.connect();
        match tokio::time::timeout(limit, self.establish(generation)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!(
                "connecting to {} timed out after {limit:?}",
                format_target(&self.credential.host, self.credential.port)
            ))),
        }
    }
}
